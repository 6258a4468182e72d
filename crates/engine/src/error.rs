//! Engine-level error types.

use thiserror::Error;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The DAG broke one or more graph rules. Every broken rule is listed.
    #[error("DAG validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Topological sort detected a cycle.
    #[error("DAG contains a cycle")]
    CycleDetected,

    /// A node's payload could not be turned into a request at run time.
    #[error("node '{node_id}' is invalid: {message}")]
    InvalidNode { node_id: String, message: String },

    // ------ Execution errors ------

    /// An activity failed fatally or exhausted its retries.
    #[error("{message}")]
    Activity {
        activity: &'static str,
        message: String,
    },

    /// The run was cancelled from outside.
    #[error("execution cancelled")]
    Cancelled,

    /// The recorded history disagrees with the calls the orchestration makes.
    #[error("non-deterministic replay at seq {seq}: history has '{recorded}', orchestration called '{called}'")]
    NonDeterminism {
        seq: i32,
        recorded: String,
        called: &'static str,
    },

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Infrastructure failures that another attempt of the same run may get
    /// past. These never mark the execution `FAILED` by themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
