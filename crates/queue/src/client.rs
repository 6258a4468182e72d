//! Runtime client: how the execution service hands work to the workers.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use db::{DbError, Store, models::ExecutionRow};

use crate::{QueueError, TASK_QUEUE};

#[derive(Clone)]
pub struct RuntimeClient {
    store: Arc<dyn Store>,
    task_queue: String,
}

impl RuntimeClient {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_queue(store, TASK_QUEUE)
    }

    pub fn with_queue(store: Arc<dyn Store>, task_queue: impl Into<String>) -> Self {
        Self { store, task_queue: task_queue.into() }
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Durably start a run keyed by `execution_id`: the `PENDING` execution
    /// and its run task are written together, so a returned row is always
    /// picked up by some worker.
    #[instrument(skip(self))]
    pub async fn start(&self, workflow_id: Uuid, execution_id: Uuid) -> Result<ExecutionRow, QueueError> {
        let row = self
            .store
            .create_execution(execution_id, workflow_id, &self.task_queue)
            .await?;
        info!(task_queue = %self.task_queue, "execution enqueued");
        Ok(row)
    }

    /// Ask the worker running `execution_id` to stop. The execution ends up
    /// `FAILED` with `"execution cancelled"` unless it finished first.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), QueueError> {
        match self.store.get_execution(execution_id).await {
            Ok(_) => {}
            Err(DbError::NotFound) => return Err(QueueError::ExecutionNotFound(execution_id)),
            Err(e) => return Err(e.into()),
        }
        if !self.store.request_cancel(execution_id).await? {
            return Err(QueueError::ExecutionNotFound(execution_id));
        }
        info!("cancellation requested");
        Ok(())
    }
}
