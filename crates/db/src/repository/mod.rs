//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` (or an executor inside a transaction)
//! and returns a `Result<T, DbError>`. No business logic, no domain types —
//! pure SQL.

pub mod workflows;
pub mod versions;
pub mod executions;
pub mod tasks;
pub mod history;
