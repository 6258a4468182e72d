//! Service-layer error taxonomy.

use thiserror::Error;

use db::DbError;
use queue::QueueError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The DAG broke one or more graph rules; every reason is listed.
    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("workflow not found")]
    WorkflowNotFound,

    /// Any other missing resource (`"version"`, `"execution"`).
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DbError> for ServiceError {
    fn from(e: DbError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<QueueError> for ServiceError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::ExecutionNotFound(_) => Self::NotFound("execution"),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("stored DAG is malformed: {e}"))
    }
}
