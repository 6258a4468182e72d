//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node unit (HTTP call, code evaluation).
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` — the activity is attempted again with exponential back-off.
/// - `Fatal`     — the execution is immediately marked as failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// Transient failure; the engine should re-try the activity.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Retryable(_))
    }

    /// The message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            NodeError::Retryable(m) | NodeError::Fatal(m) => m,
        }
    }
}
