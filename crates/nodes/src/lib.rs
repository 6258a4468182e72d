//! `nodes` crate — node data schemas and the side-effecting node units.
//!
//! [`schema`] turns a node's untyped `data` into a [`NodeKind`]; [`http`]
//! and [`sandbox`] are what the engine's activities call for `http` and
//! `code` nodes.

pub mod error;
pub mod http;
pub mod sandbox;
pub mod schema;

pub use error::NodeError;
pub use http::{HttpClient, HttpRequestInput, HttpRequestOutput};
pub use sandbox::{CodeExecutionInput, CodeExecutionOutput, Sandbox};
pub use schema::{CodeNodeData, DataIssue, HttpMethod, HttpNodeData, LabelData, NodeKind};
