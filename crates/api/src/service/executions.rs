//! Execution Service: starts runs and answers status queries.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use db::{models::ExecutionRow, DbError, Store};
use queue::RuntimeClient;

use super::ServiceError;

pub const DEFAULT_LIST_LIMIT: i64 = 50;

pub struct ExecutionService {
    store: Arc<dyn Store>,
    runtime: RuntimeClient,
}

impl ExecutionService {
    pub fn new(store: Arc<dyn Store>, runtime: RuntimeClient) -> Self {
        Self { store, runtime }
    }

    /// Create a `PENDING` execution of `workflow_id` and durably hand it to
    /// the runtime. Returns once the run is enqueued, not once it finishes.
    #[instrument(skip(self))]
    pub async fn start(&self, workflow_id: Uuid) -> Result<ExecutionRow, ServiceError> {
        if !self.store.workflow_exists(workflow_id).await? {
            return Err(ServiceError::WorkflowNotFound);
        }
        let execution_id = Uuid::new_v4();
        let row = self.runtime.start(workflow_id, execution_id).await?;
        info!(%execution_id, "execution started");
        Ok(row)
    }

    pub async fn get(&self, id: Uuid) -> Result<ExecutionRow, ServiceError> {
        match self.store.get_execution(id).await {
            Ok(row) => Ok(row),
            Err(DbError::NotFound) => Err(ServiceError::NotFound("execution")),
            Err(e) => Err(e.into()),
        }
    }

    /// Executions of a workflow, newest first, and how many there are.
    pub async fn list(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ExecutionRow>, i64), ServiceError> {
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit };
        Ok(self
            .store
            .list_executions(workflow_id, limit, offset.max(0))
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<(), ServiceError> {
        self.runtime.cancel(id).await?;
        Ok(())
    }
}
