//! Business logic behind the management API.
//!
//! Handlers stay thin: they parse the request, call one of these services
//! and shape the response.

pub mod canonical;
pub mod error;
pub mod executions;
pub mod workflows;

pub use error::ServiceError;
pub use executions::ExecutionService;
pub use workflows::{Workflow, WorkflowPage, WorkflowService};
