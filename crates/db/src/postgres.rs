//! [`Store`] backed by Postgres through the repository functions.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{
        ActivityEventRow, ExecutionRow, ExecutionStatus, RunTaskRow, WorkflowChange,
        WorkflowListQuery, WorkflowRow, WorkflowSummaryRow, WorkflowVersionRow,
    },
    repository::{executions, history, tasks, versions, workflows},
    store::{Lease, Store},
};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_workflow(
        &self,
        name: &str,
        dag_json: &serde_json::Value,
    ) -> Result<WorkflowRow, DbError> {
        workflows::create_workflow(&self.pool, name, dag_json).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn workflow_exists(&self, id: Uuid) -> Result<bool, DbError> {
        workflows::workflow_exists(&self.pool, id).await
    }

    async fn list_workflow_summaries(
        &self,
        query: &WorkflowListQuery,
    ) -> Result<(Vec<WorkflowSummaryRow>, i64), DbError> {
        workflows::list_workflow_summaries(&self.pool, query).await
    }

    async fn apply_workflow_change(&self, change: &WorkflowChange) -> Result<WorkflowRow, DbError> {
        workflows::apply_workflow_change(&self.pool, change).await
    }

    async fn current_version(&self, workflow_id: Uuid) -> Result<i32, DbError> {
        versions::current_version(&self.pool, workflow_id).await
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersionRow>, DbError> {
        versions::list_versions(&self.pool, workflow_id).await
    }

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, DbError> {
        versions::get_version(&self.pool, workflow_id, version_number).await
    }

    async fn create_execution(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        task_queue: &str,
    ) -> Result<ExecutionRow, DbError> {
        executions::create_execution(&self.pool, execution_id, workflow_id, task_queue).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError> {
        executions::get_execution(&self.pool, id).await
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ExecutionRow>, i64), DbError> {
        executions::list_executions(&self.pool, workflow_id, limit, offset).await
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<bool, DbError> {
        executions::update_execution_status(&self.pool, id, status).await
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, DbError> {
        executions::complete_execution(&self.pool, id, result).await
    }

    async fn fail_execution(&self, id: Uuid, error: &str) -> Result<bool, DbError> {
        executions::fail_execution(&self.pool, id, error).await
    }

    async fn claim_next_task(
        &self,
        task_queue: &str,
        lease: &Lease,
    ) -> Result<Option<RunTaskRow>, DbError> {
        tasks::claim_next_task(&self.pool, task_queue, lease).await
    }

    async fn heartbeat_task(&self, task_id: Uuid, lease: &Lease) -> Result<bool, DbError> {
        tasks::heartbeat_task(&self.pool, task_id, lease).await
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), DbError> {
        tasks::complete_task(&self.pool, task_id).await
    }

    async fn release_task(&self, task_id: Uuid, error: &str) -> Result<(), DbError> {
        tasks::release_task(&self.pool, task_id, error).await
    }

    async fn request_cancel(&self, execution_id: Uuid) -> Result<bool, DbError> {
        tasks::request_cancel(&self.pool, execution_id).await
    }

    async fn load_history(&self, execution_id: Uuid) -> Result<Vec<ActivityEventRow>, DbError> {
        history::load_history(&self.pool, execution_id).await
    }

    async fn get_history_event(
        &self,
        execution_id: Uuid,
        seq: i32,
    ) -> Result<Option<ActivityEventRow>, DbError> {
        history::get_history_event(&self.pool, execution_id, seq).await
    }

    async fn append_history(&self, event: &ActivityEventRow) -> Result<bool, DbError> {
        history::append_history(&self.pool, event).await
    }
}
