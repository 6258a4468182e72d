//! `queue` crate — the hand-off between the execution service and the
//! durable runtime.
//!
//! All runs travel over a single task queue. [`RuntimeClient`] enqueues and
//! cancels runs; [`Worker`] claims them under a lease and drives them
//! through the engine.

pub mod client;
pub mod error;
pub mod worker;

pub use client::RuntimeClient;
pub use error::QueueError;
pub use worker::{Worker, WorkerConfig};

/// Name of the shared task queue.
pub const TASK_QUEUE: &str = "workflow-task-queue";
