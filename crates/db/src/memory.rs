//! In-process [`Store`] with the same transition rules as the Postgres one.
//!
//! Used by the test suites and by `dagflow serve --in-memory`. Everything
//! lives behind a single async mutex, so each trait call is atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        ActivityEventRow, ExecutionRow, ExecutionStatus, RunTaskRow, TaskStatus, WorkflowChange,
        WorkflowListQuery, WorkflowRow, WorkflowSummaryRow, WorkflowVersionRow,
    },
    repository::tasks::DEFAULT_MAX_ATTEMPTS,
    store::{Lease, Store},
};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowRow>,
    versions: HashMap<Uuid, Vec<WorkflowVersionRow>>,
    executions: HashMap<Uuid, ExecutionRow>,
    tasks: Vec<RunTaskRow>,
    history: HashMap<Uuid, Vec<ActivityEventRow>>,
}

impl Tables {
    fn push_version(&mut self, workflow_id: Uuid, name: &str, dag_json: &serde_json::Value) {
        let list = self.versions.entry(workflow_id).or_default();
        let next = list.iter().map(|v| v.version_number).max().unwrap_or(0) + 1;
        list.push(WorkflowVersionRow {
            id: Uuid::new_v4(),
            workflow_id,
            version_number: next,
            name: name.to_owned(),
            dag_json: dag_json.clone(),
            created_at: Utc::now(),
        });
    }

    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut RunTaskRow, DbError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(DbError::NotFound)
    }

    fn summary(&self, wf: &WorkflowRow) -> WorkflowSummaryRow {
        let count = |key: &str| {
            wf.dag_json
                .get(key)
                .and_then(|v| v.as_array())
                .map(|a| a.len() as i32)
                .unwrap_or(0)
        };
        // finished_at DESC NULLS LAST, then started_at DESC
        let last = self
            .executions
            .values()
            .filter(|e| e.workflow_id == wf.id)
            .max_by(|a, b| {
                match (a.finished_at, b.finished_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                }
                .then(a.started_at.cmp(&b.started_at))
            });

        WorkflowSummaryRow {
            id: wf.id,
            name: wf.name.clone(),
            updated_at: wf.updated_at,
            node_count: count("nodes"),
            edge_count: count("edges"),
            last_exec_id: last.map(|e| e.id),
            last_exec_status: last.map(|e| e.status.clone()),
            last_exec_finished_at: last.and_then(|e| e.finished_at),
        }
    }

    fn finish(
        &mut self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, DbError> {
        let row = self.executions.get_mut(&id).ok_or(DbError::NotFound)?;
        if row.status().is_terminal() {
            return Ok(false);
        }
        row.status = status.as_str().to_owned();
        row.result_json = result;
        row.error = error;
        row.finished_at = Some(Utc::now());
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All run tasks, oldest first. Test helper.
    pub async fn tasks(&self) -> Vec<RunTaskRow> {
        self.inner.lock().await.tasks.clone()
    }

    /// Drop every version of a workflow, leaving it as a row written before
    /// versioning existed. Test helper.
    pub async fn clear_versions(&self, workflow_id: Uuid) {
        self.inner.lock().await.versions.remove(&workflow_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_workflow(
        &self,
        name: &str,
        dag_json: &serde_json::Value,
    ) -> Result<WorkflowRow, DbError> {
        let now = Utc::now();
        let row = WorkflowRow {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            dag_json: dag_json.clone(),
            created_at: now,
            updated_at: now,
        };
        let mut t = self.inner.lock().await;
        t.push_version(row.id, name, dag_json);
        t.workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        self.inner
            .lock()
            .await
            .workflows
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn workflow_exists(&self, id: Uuid) -> Result<bool, DbError> {
        Ok(self.inner.lock().await.workflows.contains_key(&id))
    }

    async fn list_workflow_summaries(
        &self,
        query: &WorkflowListQuery,
    ) -> Result<(Vec<WorkflowSummaryRow>, i64), DbError> {
        let t = self.inner.lock().await;
        let needle = query
            .search
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut matching: Vec<&WorkflowRow> = t
            .workflows
            .values()
            .filter(|w| match &needle {
                Some(n) => w.name.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .map(|w| t.summary(w))
            .collect();
        Ok((page, total))
    }

    async fn apply_workflow_change(&self, change: &WorkflowChange) -> Result<WorkflowRow, DbError> {
        let mut t = self.inner.lock().await;
        let current = t.workflows.get(&change.id).ok_or(DbError::NotFound)?;
        if current.updated_at != change.expected_updated_at {
            return Err(DbError::Conflict(format!("workflow {}", change.id)));
        }

        for snapshot in &change.snapshots {
            t.push_version(change.id, &snapshot.name, &snapshot.dag_json);
        }

        let row = t.workflows.get_mut(&change.id).ok_or(DbError::NotFound)?;
        row.name = change.name.clone();
        row.dag_json = change.dag_json.clone();
        // strictly increasing so a stale expected_updated_at never matches again
        let now = Utc::now();
        row.updated_at = if now > row.updated_at {
            now
        } else {
            row.updated_at + chrono::Duration::microseconds(1)
        };
        Ok(row.clone())
    }

    async fn current_version(&self, workflow_id: Uuid) -> Result<i32, DbError> {
        Ok(self
            .inner
            .lock()
            .await
            .versions
            .get(&workflow_id)
            .and_then(|l| l.iter().map(|v| v.version_number).max())
            .unwrap_or(0))
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersionRow>, DbError> {
        let mut list = self
            .inner
            .lock()
            .await
            .versions
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        Ok(list)
    }

    async fn get_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, DbError> {
        self.inner
            .lock()
            .await
            .versions
            .get(&workflow_id)
            .and_then(|l| l.iter().find(|v| v.version_number == version_number))
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn create_execution(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        task_queue: &str,
    ) -> Result<ExecutionRow, DbError> {
        let mut t = self.inner.lock().await;
        if t.executions.contains_key(&execution_id) {
            return Err(DbError::Conflict(format!("execution {execution_id}")));
        }
        let now = Utc::now();
        let row = ExecutionRow {
            id: execution_id,
            workflow_id,
            status: ExecutionStatus::Pending.as_str().to_owned(),
            result_json: None,
            error: None,
            started_at: now,
            finished_at: None,
        };
        t.executions.insert(execution_id, row.clone());
        t.tasks.push(RunTaskRow {
            id: Uuid::new_v4(),
            execution_id,
            workflow_id,
            task_queue: task_queue.to_owned(),
            status: TaskStatus::Pending.as_str().to_owned(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        Ok(row)
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError> {
        self.inner
            .lock()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ExecutionRow>, i64), DbError> {
        let t = self.inner.lock().await;
        let mut rows: Vec<ExecutionRow> = t
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = rows.len() as i64;
        let page = rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<bool, DbError> {
        let mut t = self.inner.lock().await;
        match status {
            ExecutionStatus::Pending => Ok(false),
            ExecutionStatus::Running => {
                let row = t.executions.get_mut(&id).ok_or(DbError::NotFound)?;
                if row.status() != ExecutionStatus::Pending {
                    return Ok(false);
                }
                row.status = status.as_str().to_owned();
                Ok(true)
            }
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                let row = t.executions.get_mut(&id).ok_or(DbError::NotFound)?;
                if row.status().is_terminal() {
                    return Ok(false);
                }
                row.status = status.as_str().to_owned();
                row.finished_at = Some(Utc::now());
                Ok(true)
            }
        }
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, DbError> {
        self.inner
            .lock()
            .await
            .finish(id, ExecutionStatus::Completed, Some(result.clone()), None)
    }

    async fn fail_execution(&self, id: Uuid, error: &str) -> Result<bool, DbError> {
        self.inner
            .lock()
            .await
            .finish(id, ExecutionStatus::Failed, None, Some(error.to_owned()))
    }

    async fn claim_next_task(
        &self,
        task_queue: &str,
        lease: &Lease,
    ) -> Result<Option<RunTaskRow>, DbError> {
        let mut t = self.inner.lock().await;
        let now = Utc::now();
        let runnable = t.tasks.iter_mut().find(|task| {
            task.task_queue == task_queue
                && (task.status == TaskStatus::Pending.as_str()
                    || (task.status == TaskStatus::Running.as_str()
                        && task.lease_expires_at.is_some_and(|at| at < now)))
        });

        Ok(runnable.map(|task| {
            task.status = TaskStatus::Running.as_str().to_owned();
            task.attempts += 1;
            task.lease_owner = Some(lease.owner.clone());
            task.lease_expires_at = Some(now + lease.duration);
            task.updated_at = now;
            task.clone()
        }))
    }

    async fn heartbeat_task(&self, task_id: Uuid, lease: &Lease) -> Result<bool, DbError> {
        let mut t = self.inner.lock().await;
        let task = t.task_mut(task_id)?;
        if task.status != TaskStatus::Running.as_str()
            || task.lease_owner.as_deref() != Some(lease.owner.as_str())
        {
            return Err(DbError::Conflict(format!("lease on task {task_id} lost")));
        }
        let now = Utc::now();
        task.lease_expires_at = Some(now + lease.duration);
        task.updated_at = now;
        Ok(task.cancel_requested)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), DbError> {
        let mut t = self.inner.lock().await;
        let task = t.task_mut(task_id)?;
        task.status = TaskStatus::Completed.as_str().to_owned();
        task.lease_expires_at = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn release_task(&self, task_id: Uuid, error: &str) -> Result<(), DbError> {
        let mut t = self.inner.lock().await;
        let task = t.task_mut(task_id)?;
        let status = if task.attempts >= task.max_attempts {
            TaskStatus::DeadLettered
        } else {
            TaskStatus::Pending
        };
        task.status = status.as_str().to_owned();
        task.lease_owner = None;
        task.lease_expires_at = None;
        task.last_error = Some(error.to_owned());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, execution_id: Uuid) -> Result<bool, DbError> {
        let mut t = self.inner.lock().await;
        let mut found = false;
        for task in t.tasks.iter_mut().filter(|t| t.execution_id == execution_id) {
            task.cancel_requested = true;
            task.updated_at = Utc::now();
            found = true;
        }
        Ok(found)
    }

    async fn load_history(&self, execution_id: Uuid) -> Result<Vec<ActivityEventRow>, DbError> {
        let mut events = self
            .inner
            .lock()
            .await
            .history
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn get_history_event(
        &self,
        execution_id: Uuid,
        seq: i32,
    ) -> Result<Option<ActivityEventRow>, DbError> {
        let t = self.inner.lock().await;
        Ok(t.history
            .get(&execution_id)
            .and_then(|events| events.iter().find(|e| e.seq == seq))
            .cloned())
    }

    async fn append_history(&self, event: &ActivityEventRow) -> Result<bool, DbError> {
        let mut t = self.inner.lock().await;
        let events = t.history.entry(event.execution_id).or_default();
        if events.iter().any(|e| e.seq == event.seq) {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VersionSnapshot;
    use serde_json::json;

    fn lease(owner: &str) -> Lease {
        Lease {
            owner: owner.to_owned(),
            duration: chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn insert_workflow_creates_version_one() {
        let store = MemoryStore::new();
        let wf = store.insert_workflow("wf", &json!({"nodes": [], "edges": []})).await.unwrap();

        assert_eq!(store.current_version(wf.id).await.unwrap(), 1);
        let v1 = store.get_version(wf.id, 1).await.unwrap();
        assert_eq!(v1.name, "wf");
        assert!(matches!(store.get_version(wf.id, 2).await, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn apply_change_appends_sequential_versions() {
        let store = MemoryStore::new();
        let wf = store.insert_workflow("a", &json!({"nodes": []})).await.unwrap();

        let updated = store
            .apply_workflow_change(&WorkflowChange {
                id: wf.id,
                expected_updated_at: wf.updated_at,
                snapshots: vec![VersionSnapshot::from(&wf), VersionSnapshot::from(&wf)],
                name: "b".into(),
                dag_json: json!({"nodes": [1]}),
            })
            .await
            .unwrap();

        assert_eq!(updated.name, "b");
        assert!(updated.updated_at > wf.updated_at);
        let numbers: Vec<i32> = store
            .list_versions(wf.id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn stale_change_is_a_conflict() {
        let store = MemoryStore::new();
        let wf = store.insert_workflow("a", &json!({})).await.unwrap();
        let change = WorkflowChange {
            id: wf.id,
            expected_updated_at: wf.updated_at,
            snapshots: vec![],
            name: "b".into(),
            dag_json: json!({}),
        };
        store.apply_workflow_change(&change).await.unwrap();

        let err = store.apply_workflow_change(&change).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let store = MemoryStore::new();
        let wf = store.insert_workflow("a", &json!({})).await.unwrap();
        let id = Uuid::new_v4();
        store.create_execution(id, wf.id, "q").await.unwrap();

        assert!(store.update_execution_status(id, ExecutionStatus::Running).await.unwrap());
        assert!(!store.update_execution_status(id, ExecutionStatus::Running).await.unwrap());
        assert!(store.complete_execution(id, &json!({"ok": true})).await.unwrap());
        assert!(!store.fail_execution(id, "late").await.unwrap());

        let row = store.get_execution(id).await.unwrap();
        assert_eq!(row.status(), ExecutionStatus::Completed);
        assert_eq!(row.result_json, Some(json!({"ok": true})));
        assert!(row.error.is_none());
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn claimed_task_is_not_claimed_twice_until_released() {
        let store = MemoryStore::new();
        let wf = store.insert_workflow("a", &json!({})).await.unwrap();
        let id = Uuid::new_v4();
        store.create_execution(id, wf.id, "q").await.unwrap();

        let task = store.claim_next_task("q", &lease("w1")).await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert!(store.claim_next_task("q", &lease("w2")).await.unwrap().is_none());
        assert!(store.claim_next_task("other", &lease("w2")).await.unwrap().is_none());

        assert!(store.heartbeat_task(task.id, &lease("w2")).await.is_err());
        assert!(!store.heartbeat_task(task.id, &lease("w1")).await.unwrap());
        assert!(store.request_cancel(id).await.unwrap());
        assert!(store.heartbeat_task(task.id, &lease("w1")).await.unwrap());

        store.release_task(task.id, "boom").await.unwrap();
        let again = store.claim_next_task("q", &lease("w2")).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn release_dead_letters_after_max_attempts() {
        let store = MemoryStore::new();
        let wf = store.insert_workflow("a", &json!({})).await.unwrap();
        store.create_execution(Uuid::new_v4(), wf.id, "q").await.unwrap();

        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            let task = store.claim_next_task("q", &lease("w")).await.unwrap().unwrap();
            store.release_task(task.id, "boom").await.unwrap();
        }

        assert!(store.claim_next_task("q", &lease("w")).await.unwrap().is_none());
        let tasks = store.tasks().await;
        assert_eq!(tasks[0].status, TaskStatus::DeadLettered.as_str());
        assert_eq!(tasks[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn history_keeps_first_write_per_seq() {
        let store = MemoryStore::new();
        let execution_id = Uuid::new_v4();
        let event = |output: serde_json::Value| ActivityEventRow {
            execution_id,
            seq: 0,
            activity: "GetWorkflowDAG".into(),
            input_json: json!({}),
            output_json: Some(output),
            error: None,
            recorded_at: Utc::now(),
        };
        assert!(store.append_history(&event(json!(1))).await.unwrap());
        assert!(!store.append_history(&event(json!(2))).await.unwrap());

        let history = store.load_history(execution_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].output_json, Some(json!(1)));

        let stored = store.get_history_event(execution_id, 0).await.unwrap().unwrap();
        assert_eq!(stored.output_json, Some(json!(1)));
        assert!(store.get_history_event(execution_id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summaries_filter_and_report_last_execution() {
        let store = MemoryStore::new();
        let a = store
            .insert_workflow("Alpha flow", &json!({"nodes": [{}, {}], "edges": [{}]}))
            .await
            .unwrap();
        store.insert_workflow("beta", &json!({})).await.unwrap();
        let exec = Uuid::new_v4();
        store.create_execution(exec, a.id, "q").await.unwrap();
        store.fail_execution(exec, "x").await.unwrap();

        let (rows, total) = store
            .list_workflow_summaries(&WorkflowListQuery {
                limit: 10,
                offset: 0,
                search: Some("ALPHA".into()),
            })
            .await
            .unwrap();

        assert_eq!(total, 1);
        assert_eq!(rows[0].node_count, 2);
        assert_eq!(rows[0].edge_count, 1);
        assert_eq!(rows[0].last_exec_id, Some(exec));
        assert_eq!(rows[0].last_exec_status.as_deref(), Some("FAILED"));
    }
}
