//! Task-queue worker.
//!
//! Polls the store for runnable tasks, runs each one through the
//! [`WorkflowExecutor`] with bounded concurrency, and keeps the task's lease
//! alive while it runs. A worker that dies simply stops heartbeating; once
//! its lease expires another worker claims the task and the executor
//! resumes the run from its recorded history.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::{DbError, Lease, Store, models::RunTaskRow};
use engine::WorkflowExecutor;

use crate::{QueueError, TASK_QUEUE};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub task_queue: String,
    /// Maximum runs in flight at once.
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            task_queue: TASK_QUEUE.to_owned(),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    fn lease(&self) -> Lease {
        Lease {
            owner: self.worker_id.clone(),
            duration: chrono::Duration::from_std(self.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Leases are renewed three times per lease period.
    fn heartbeat_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(10))
    }
}

#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn Store>,
    executor: Arc<WorkflowExecutor>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, executor: Arc<WorkflowExecutor>, config: WorkerConfig) -> Self {
        Self { store, executor, config }
    }

    /// Poll until `shutdown` fires, then wait for in-flight runs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting worker",
        );

        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker shutting down, waiting for in-flight runs");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_and_dispatch(&semaphore).await {
                        error!("polling cycle failed: {}", err);
                    }
                }
            }
        }

        // every permit back means nothing is running
        if semaphore.acquire_many(concurrency as u32).await.is_err() {
            warn!("worker semaphore closed before in-flight runs finished");
        }
        info!("worker stopped");
        Ok(())
    }

    /// Claim and fully process at most one task. Returns whether a task was
    /// found.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        match self.store.claim_next_task(&self.config.task_queue, &self.config.lease()).await? {
            Some(task) => {
                self.process(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn poll_and_dispatch(&self, semaphore: &Arc<Semaphore>) -> Result<(), QueueError> {
        let lease = self.config.lease();
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(task) = self.store.claim_next_task(&self.config.task_queue, &lease).await? else {
                break;
            };
            debug!(task_id = %task.id, execution_id = %task.execution_id, "dispatching task");
            let worker = self.clone();
            tokio::spawn(async move { worker.process_with_permit(task, permit).await });
        }
        Ok(())
    }

    async fn process_with_permit(&self, task: RunTaskRow, _permit: OwnedSemaphorePermit) {
        let task_id = task.id;
        if let Err(err) = self.process(task).await {
            error!(%task_id, "task processing failed: {}", err);
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id, execution_id = %task.execution_id, attempt = task.attempts))]
    async fn process(&self, task: RunTaskRow) -> Result<(), QueueError> {
        let run_token = CancellationToken::new();
        if task.cancel_requested {
            run_token.cancel();
        }

        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            task.id,
            self.config.lease(),
            self.config.heartbeat_interval(),
            run_token.clone(),
            stop_heartbeat.clone(),
        ));

        let result = self
            .executor
            .run(task.workflow_id, task.execution_id, run_token)
            .await;

        stop_heartbeat.cancel();
        heartbeat.await?;

        match result {
            Ok(_) => {
                self.store.complete_task(task.id).await?;
                info!("task completed");
            }
            Err(err) if err.is_retryable() => {
                // infrastructure trouble: hand the task back for another try,
                // and only give up on the execution with the last attempt
                let message = err.to_string();
                warn!("releasing task after database error: {}", message);
                self.store.release_task(task.id, &message).await?;
                if task.attempts >= task.max_attempts {
                    warn!("task is out of attempts, failing the execution");
                    self.store.fail_execution(task.execution_id, &message).await?;
                }
            }
            Err(err) => {
                // the executor already stored the failure; this covers the
                // cases where that write itself could not be made
                self.store.fail_execution(task.execution_id, &err.to_string()).await?;
                self.store.complete_task(task.id).await?;
                info!("task finished with a failed execution");
            }
        }
        Ok(())
    }
}

async fn heartbeat_loop(
    store: Arc<dyn Store>,
    task_id: Uuid,
    lease: Lease,
    every: Duration,
    run_token: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match store.heartbeat_task(task_id, &lease).await {
            Ok(true) if !run_token.is_cancelled() => {
                info!(%task_id, "cancellation requested, stopping run");
                run_token.cancel();
            }
            Ok(_) => {}
            Err(DbError::Conflict(msg)) => {
                warn!(%task_id, "{}", msg);
                return;
            }
            Err(err) => warn!(%task_id, "heartbeat failed: {}", err),
        }
    }
}
