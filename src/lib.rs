//! # taskmesh
//!
//! Scheduling core for a distributed task system.
//!
//! Workers register and heartbeat; tasks are queued by priority and
//! creation time and dispatched to the least-loaded live worker; tasks that
//! overstay their timeout are requeued with bounded retries. State lives in
//! a [`store::Store`], either in memory or in Postgres, and the dispatch
//! queue is rebuilt from it on startup.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod registry;
pub mod store;
pub mod telemetry;
