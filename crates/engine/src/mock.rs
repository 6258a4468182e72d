//! Test doubles for the runtime.
//!
//! [`MockActivities`] records calls to [`Activities`]. HTTP calls are
//! answered from canned responses keyed by URL; every other activity runs
//! for real against the given store and an in-process sandbox.
//!
//! [`FlakyStore`] wraps a [`Store`] and injects faults into history writes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use db::{
    DbError, Lease, Store,
    models::{
        ActivityEventRow, ExecutionRow, ExecutionStatus, RunTaskRow, WorkflowChange,
        WorkflowListQuery, WorkflowRow, WorkflowSummaryRow, WorkflowVersionRow,
    },
};
use nodes::{HttpClient, HttpRequestOutput, NodeError, Sandbox};

use crate::activities::{Activities, ActivityCall, DefaultActivities};

pub struct MockActivities {
    inner: DefaultActivities,
    responses: Mutex<HashMap<String, VecDeque<Result<HttpRequestOutput, NodeError>>>>,
    calls: Mutex<Vec<ActivityCall>>,
}

impl MockActivities {
    pub fn new(store: Arc<dyn Store>) -> Result<Self, NodeError> {
        Ok(Self {
            inner: DefaultActivities::new(store, HttpClient::new()?, Sandbox::new()),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a response for `url`. Responses are consumed in order; the last
    /// one keeps answering once the others are used up.
    pub fn respond(&self, url: &str, response: Result<HttpRequestOutput, NodeError>) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_owned())
            .or_default()
            .push_back(response);
        self
    }

    /// A JSON response as the HTTP client would produce it.
    pub fn json_response(status_code: u16, data: Value) -> HttpRequestOutput {
        HttpRequestOutput {
            status_code,
            headers: BTreeMap::from([(
                "content-type".to_owned(),
                vec!["application/json".to_owned()],
            )]),
            body: data.to_string(),
            data: Some(data),
        }
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<ActivityCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(ActivityCall::name).collect()
    }

    /// Number of calls of the named activity.
    pub fn count(&self, activity: &str) -> usize {
        self.calls().iter().filter(|c| c.name() == activity).count()
    }

    fn next_response(&self, url: &str) -> Result<HttpRequestOutput, NodeError> {
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(NodeError::Fatal("empty response queue".into()))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(NodeError::Fatal("empty response queue".into()))),
            None => Err(NodeError::Retryable(format!("failed to execute request: no route to {url}"))),
        }
    }
}

#[async_trait]
impl Activities for MockActivities {
    async fn execute(&self, call: &ActivityCall) -> Result<Value, NodeError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());

        match call {
            ActivityCall::HttpRequest(input) => {
                let output = self.next_response(&input.url)?;
                serde_json::to_value(output).map_err(|e| NodeError::Fatal(e.to_string()))
            }
            other => self.inner.execute(other).await,
        }
    }
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// A [`Store`] that delegates to `inner` except for the history writes it
/// was told to disturb.
pub struct FlakyStore {
    inner: Arc<dyn Store>,
    failing_seqs: Mutex<Vec<i32>>,
    preempted: Mutex<Vec<ActivityEventRow>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            failing_seqs: Mutex::new(Vec::new()),
            preempted: Mutex::new(Vec::new()),
        }
    }

    /// The next history write at `seq` fails with a transient error.
    pub fn fail_append_once(&self, seq: i32) -> &Self {
        self.failing_seqs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(seq);
        self
    }

    /// The next history write at `event.seq` finds `event` already stored,
    /// as if another worker had recorded it a moment earlier.
    pub fn preempt_append(&self, event: ActivityEventRow) -> &Self {
        self.preempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self
    }

    fn take_failure(&self, seq: i32) -> bool {
        let mut seqs = self.failing_seqs.lock().unwrap_or_else(PoisonError::into_inner);
        match seqs.iter().position(|s| *s == seq) {
            Some(i) => {
                seqs.remove(i);
                true
            }
            None => false,
        }
    }

    fn take_preempted(&self, event: &ActivityEventRow) -> Option<ActivityEventRow> {
        let mut events = self.preempted.lock().unwrap_or_else(PoisonError::into_inner);
        let i = events
            .iter()
            .position(|e| e.execution_id == event.execution_id && e.seq == event.seq)?;
        Some(events.remove(i))
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_workflow(
        &self,
        name: &str,
        dag_json: &Value,
    ) -> Result<WorkflowRow, DbError> {
        self.inner.insert_workflow(name, dag_json).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        self.inner.get_workflow(id).await
    }

    async fn workflow_exists(&self, id: Uuid) -> Result<bool, DbError> {
        self.inner.workflow_exists(id).await
    }

    async fn list_workflow_summaries(
        &self,
        query: &WorkflowListQuery,
    ) -> Result<(Vec<WorkflowSummaryRow>, i64), DbError> {
        self.inner.list_workflow_summaries(query).await
    }

    async fn apply_workflow_change(&self, change: &WorkflowChange) -> Result<WorkflowRow, DbError> {
        self.inner.apply_workflow_change(change).await
    }

    async fn current_version(&self, workflow_id: Uuid) -> Result<i32, DbError> {
        self.inner.current_version(workflow_id).await
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersionRow>, DbError> {
        self.inner.list_versions(workflow_id).await
    }

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, DbError> {
        self.inner.get_version(workflow_id, version_number).await
    }

    async fn create_execution(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        task_queue: &str,
    ) -> Result<ExecutionRow, DbError> {
        self.inner.create_execution(execution_id, workflow_id, task_queue).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError> {
        self.inner.get_execution(id).await
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ExecutionRow>, i64), DbError> {
        self.inner.list_executions(workflow_id, limit, offset).await
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<bool, DbError> {
        self.inner.update_execution_status(id, status).await
    }

    async fn complete_execution(&self, id: Uuid, result: &Value) -> Result<bool, DbError> {
        self.inner.complete_execution(id, result).await
    }

    async fn fail_execution(&self, id: Uuid, error: &str) -> Result<bool, DbError> {
        self.inner.fail_execution(id, error).await
    }

    async fn claim_next_task(
        &self,
        task_queue: &str,
        lease: &Lease,
    ) -> Result<Option<RunTaskRow>, DbError> {
        self.inner.claim_next_task(task_queue, lease).await
    }

    async fn heartbeat_task(&self, task_id: Uuid, lease: &Lease) -> Result<bool, DbError> {
        self.inner.heartbeat_task(task_id, lease).await
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), DbError> {
        self.inner.complete_task(task_id).await
    }

    async fn release_task(&self, task_id: Uuid, error: &str) -> Result<(), DbError> {
        self.inner.release_task(task_id, error).await
    }

    async fn request_cancel(&self, execution_id: Uuid) -> Result<bool, DbError> {
        self.inner.request_cancel(execution_id).await
    }

    async fn load_history(&self, execution_id: Uuid) -> Result<Vec<ActivityEventRow>, DbError> {
        self.inner.load_history(execution_id).await
    }

    async fn get_history_event(
        &self,
        execution_id: Uuid,
        seq: i32,
    ) -> Result<Option<ActivityEventRow>, DbError> {
        self.inner.get_history_event(execution_id, seq).await
    }

    async fn append_history(&self, event: &ActivityEventRow) -> Result<bool, DbError> {
        if self.take_failure(event.seq) {
            return Err(DbError::Conflict(format!("activity_events (seq {})", event.seq)));
        }
        if let Some(earlier) = self.take_preempted(event) {
            self.inner.append_history(&earlier).await?;
        }
        self.inner.append_history(event).await
    }
}
