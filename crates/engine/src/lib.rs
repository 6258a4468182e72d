//! `engine` crate — DAG model, graph kernel, activity set and the durable
//! workflow executor.

pub mod activities;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod mock;
pub mod models;
pub mod retry;

pub use activities::{Activities, ActivityCall, ActivityTimeouts, DefaultActivities};
pub use dag::{topological_order, validate, validate_dag};
pub use error::EngineError;
pub use executor::{ExecutionResult, ExecutorConfig, WorkflowExecutor};
pub use models::{Dag, Edge, Node, Position};
pub use retry::RetryPolicy;
