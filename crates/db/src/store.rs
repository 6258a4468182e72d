//! The persistence surface seen by the services and the runtime.
//!
//! [`crate::PgStore`] is the production implementation; [`crate::MemoryStore`]
//! backs tests and the in-memory development mode.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    ActivityEventRow, ExecutionRow, ExecutionStatus, RunTaskRow, WorkflowChange,
    WorkflowListQuery, WorkflowRow, WorkflowSummaryRow, WorkflowVersionRow,
};
use crate::DbError;

/// Lease parameters used when a worker claims a run task.
#[derive(Debug, Clone)]
pub struct Lease {
    pub owner: String,
    pub duration: chrono::Duration,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ------ workflows ------

    /// Insert a workflow together with its version 1, atomically.
    async fn insert_workflow(
        &self,
        name: &str,
        dag_json: &serde_json::Value,
    ) -> Result<WorkflowRow, DbError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError>;

    async fn workflow_exists(&self, id: Uuid) -> Result<bool, DbError>;

    /// Returns one page of summaries plus the total number of matches.
    async fn list_workflow_summaries(
        &self,
        query: &WorkflowListQuery,
    ) -> Result<(Vec<WorkflowSummaryRow>, i64), DbError>;

    /// Append `change.snapshots` as new versions and overwrite the current
    /// `(name, dag)`, in one transaction.
    async fn apply_workflow_change(&self, change: &WorkflowChange) -> Result<WorkflowRow, DbError>;

    // ------ workflow_versions ------

    /// Highest version number, or `0` when the workflow has none.
    async fn current_version(&self, workflow_id: Uuid) -> Result<i32, DbError>;

    /// All versions, newest first.
    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersionRow>, DbError>;

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, DbError>;

    // ------ executions ------

    /// Insert a `PENDING` execution and its run task in one transaction.
    async fn create_execution(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        task_queue: &str,
    ) -> Result<ExecutionRow, DbError>;

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError>;

    /// Executions of one workflow, newest `started_at` first, plus the total.
    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ExecutionRow>, i64), DbError>;

    /// Move the execution to `status`, stamping `finished_at` for terminal
    /// states. Returns `false` (and changes nothing) when the transition is
    /// not allowed from the current state.
    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<bool, DbError>;

    /// `COMPLETED` with `result`, unless already terminal.
    async fn complete_execution(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, DbError>;

    /// `FAILED` with `error`, unless already terminal.
    async fn fail_execution(&self, id: Uuid, error: &str) -> Result<bool, DbError>;

    // ------ run_tasks ------

    /// Claim the oldest runnable task on `task_queue`: a pending task, or a
    /// running task whose lease has expired.
    async fn claim_next_task(
        &self,
        task_queue: &str,
        lease: &Lease,
    ) -> Result<Option<RunTaskRow>, DbError>;

    /// Extend the lease held by `lease.owner`. Returns whether cancellation
    /// has been requested for the task's execution.
    async fn heartbeat_task(&self, task_id: Uuid, lease: &Lease) -> Result<bool, DbError>;

    async fn complete_task(&self, task_id: Uuid) -> Result<(), DbError>;

    /// Put the task back to `pending`, or dead-letter it once `attempts`
    /// reached `max_attempts`.
    async fn release_task(&self, task_id: Uuid, error: &str) -> Result<(), DbError>;

    /// Flag the execution's task for cancellation. Returns `false` when no
    /// task exists for the execution.
    async fn request_cancel(&self, execution_id: Uuid) -> Result<bool, DbError>;

    // ------ activity_events ------

    /// Recorded events for an execution, ordered by `seq`.
    async fn load_history(&self, execution_id: Uuid) -> Result<Vec<ActivityEventRow>, DbError>;

    /// The event recorded at `seq`, if any.
    async fn get_history_event(
        &self,
        execution_id: Uuid,
        seq: i32,
    ) -> Result<Option<ActivityEventRow>, DbError>;

    /// Record an event. Recording the same `(execution_id, seq)` twice keeps
    /// the first event; returns `false` when an event was already there.
    async fn append_history(&self, event: &ActivityEventRow) -> Result<bool, DbError>;
}

