//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// The workflow graph: `{ "nodes": [...], "edges": [...] }`.
    pub dag_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the workflow list view.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowSummaryRow {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub node_count: i32,
    pub edge_count: i32,
    pub last_exec_id: Option<Uuid>,
    pub last_exec_status: Option<String>,
    pub last_exec_finished_at: Option<DateTime<Utc>>,
}

/// Paging and filtering for the workflow list view.
#[derive(Debug, Clone, Default)]
pub struct WorkflowListQuery {
    pub limit: i64,
    pub offset: i64,
    /// Case-insensitive substring match on the workflow name.
    pub search: Option<String>,
}

/// The `(name, dag)` pair captured by a version snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionSnapshot {
    pub name: String,
    pub dag_json: serde_json::Value,
}

impl From<&WorkflowRow> for VersionSnapshot {
    fn from(row: &WorkflowRow) -> Self {
        Self {
            name: row.name.clone(),
            dag_json: row.dag_json.clone(),
        }
    }
}

/// An atomic change to a workflow: zero or more snapshots appended to its
/// version history, followed by an overwrite of the current `(name, dag)`.
///
/// The write is rejected with [`crate::DbError::Conflict`] when the row's
/// `updated_at` no longer equals `expected_updated_at`.
#[derive(Debug, Clone)]
pub struct WorkflowChange {
    pub id: Uuid,
    pub expected_updated_at: DateTime<Utc>,
    pub snapshots: Vec<VersionSnapshot>,
    pub name: String,
    pub dag_json: serde_json::Value,
}

// ---------------------------------------------------------------------------
// workflow_versions
// ---------------------------------------------------------------------------

/// An immutable point-in-time snapshot of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowVersionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_number: i32,
    pub name: String,
    pub dag_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Possible statuses for a workflow execution.
///
/// Transitions are `Pending → Running → (Completed | Failed)`; the terminal
/// states never change once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"   => Ok(Self::Pending),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub result_json: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRow {
    /// Parsed status. Unknown strings are treated as `Failed` so that a
    /// corrupted row never looks runnable.
    pub fn status(&self) -> ExecutionStatus {
        self.status.parse().unwrap_or(ExecutionStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// run_tasks
// ---------------------------------------------------------------------------

/// Possible statuses for a queued run task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    DeadLettered,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending      => "pending",
            Self::Running      => "running",
            Self::Completed    => "completed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable hand-off from the execution service to a runtime worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunTaskRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub task_queue: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// activity_events
// ---------------------------------------------------------------------------

/// The recorded outcome of one activity call inside an execution.
///
/// `seq` is the position of the call in the orchestration; replay matches
/// calls to events by `seq` and checks `activity` for consistency.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityEventRow {
    pub execution_id: Uuid,
    pub seq: i32,
    pub activity: String,
    pub input_json: serde_json::Value,
    pub output_json: Option<serde_json::Value>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
