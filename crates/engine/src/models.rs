//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow graph looks like
//! in memory. They serialise to/from the JSONB `dag_json` column of the
//! `workflows` and `workflow_versions` tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use nodes::{DataIssue, NodeKind};

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Canvas coordinates. Carried for the editor; ignored by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within this graph (referenced by edges).
    pub id: String,
    /// `start`, `http`, `code` or `output`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    /// Type-specific payload, parsed lazily by [`Node::kind`].
    #[serde(default)]
    pub data: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::default(),
            data,
        }
    }

    /// The node's type together with its strictly-typed payload.
    pub fn kind(&self) -> Result<NodeKind, Vec<DataIssue>> {
        NodeKind::parse(&self.node_type, &self.data)
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let (source, target) = (source.into(), target.into());
        Self {
            id: format!("{source}-{target}"),
            source,
            target,
        }
    }
}

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// A complete workflow graph: `{ "nodes": [...], "edges": [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Dag {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
