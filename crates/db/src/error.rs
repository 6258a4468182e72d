//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The row changed between read and write (optimistic concurrency check).
    #[error("concurrent modification of {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Pool exhaustion, I/O hiccups, deadlocks (`40P01`) and serialization
    /// failures (`40001`) are transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Io(_))
            | DbError::Sqlx(sqlx::Error::PoolTimedOut)
            | DbError::Sqlx(sqlx::Error::PoolClosed) => true,
            DbError::Sqlx(sqlx::Error::Database(e)) => {
                matches!(e.code().as_deref(), Some("40P01") | Some("40001") | Some("55P03"))
            }
            DbError::Conflict(_) => true,
            _ => false,
        }
    }
}
