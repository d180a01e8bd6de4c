//! Scheduling engine: dispatch loop, heartbeat monitor, timeout monitor,
//! and the coordinator that wires them to the external surface.

pub mod coordinator;
pub mod heartbeat;
pub mod scheduler;
pub mod timeout;

pub use coordinator::{Coordinator, SystemStatus};
pub use heartbeat::{HeartbeatMonitor, HeartbeatReport};
pub use scheduler::{DispatchOutcome, Scheduler};
pub use timeout::{TimeoutMonitor, TimeoutReport};

use tokio::sync::watch;

/// Resolves once shutdown has been requested (or the coordinator is gone).
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
