//! Core data model.
//!
//! A task is a unit of work with a priority, a timeout and a lifecycle.
//! A worker is an external process that executes tasks and proves it is
//! alive by sending heartbeats.

pub mod task;
pub mod worker;

pub use task::{Expiry, NewTask, Priority, QueueKey, Task, TaskId, TaskStatus};
pub use worker::{Worker, WorkerRegistration, WorkerStatus};
