//! Typed error type for the queue crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
