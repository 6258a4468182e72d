//! The activity set: every side effect an orchestration can perform.
//!
//! Orchestrations never touch the store, the network or the sandbox
//! directly. They describe the side effect as an [`ActivityCall`] and hand
//! it to the durable context, which either replays a recorded outcome or
//! dispatches it through [`Activities`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use db::{DbError, Store, models::ExecutionStatus};
use nodes::{CodeExecutionInput, HttpClient, HttpRequestInput, NodeError, Sandbox};

/// One activity invocation with its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "activity", content = "input")]
pub enum ActivityCall {
    LoadDag {
        workflow_id: Uuid,
    },
    HttpRequest(HttpRequestInput),
    UpdateExecutionStatus {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    StoreExecutionResult {
        execution_id: Uuid,
        result: Value,
    },
    StoreExecutionError {
        execution_id: Uuid,
        error: String,
    },
    CodeExecution(CodeExecutionInput),
}

impl ActivityCall {
    /// Stable name, recorded in the activity history.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadDag { .. }               => "LoadDAG",
            Self::HttpRequest(_)               => "HttpRequest",
            Self::UpdateExecutionStatus { .. } => "UpdateExecutionStatus",
            Self::StoreExecutionResult { .. }  => "StoreExecutionResult",
            Self::StoreExecutionError { .. }   => "StoreExecutionError",
            Self::CodeExecution(_)             => "CodeExecution",
        }
    }

    /// Input as recorded in the activity history.
    pub fn input_json(&self) -> Result<Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("input")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

/// Per-attempt `StartToClose` bounds.
#[derive(Debug, Clone)]
pub struct ActivityTimeouts {
    pub http: Duration,
    pub database: Duration,
    pub code: Duration,
}

impl Default for ActivityTimeouts {
    fn default() -> Self {
        Self {
            http: Duration::from_secs(30),
            database: Duration::from_secs(10),
            code: Duration::from_secs(6),
        }
    }
}

impl ActivityTimeouts {
    pub fn for_call(&self, call: &ActivityCall) -> Duration {
        match call {
            ActivityCall::HttpRequest(_) => self.http,
            ActivityCall::CodeExecution(_) => self.code,
            ActivityCall::LoadDag { .. }
            | ActivityCall::UpdateExecutionStatus { .. }
            | ActivityCall::StoreExecutionResult { .. }
            | ActivityCall::StoreExecutionError { .. } => self.database,
        }
    }
}

/// Executes activity calls. A single attempt per invocation; retrying is
/// the caller's job.
#[async_trait]
pub trait Activities: Send + Sync {
    async fn execute(&self, call: &ActivityCall) -> Result<Value, NodeError>;
}

/// Production activity set backed by the store, the HTTP client and the
/// sandbox.
pub struct DefaultActivities {
    store: Arc<dyn Store>,
    http: HttpClient,
    sandbox: Sandbox,
}

impl DefaultActivities {
    pub fn new(store: Arc<dyn Store>, http: HttpClient, sandbox: Sandbox) -> Self {
        Self { store, http, sandbox }
    }
}

#[async_trait]
impl Activities for DefaultActivities {
    #[instrument(skip_all, fields(activity = call.name()))]
    async fn execute(&self, call: &ActivityCall) -> Result<Value, NodeError> {
        debug!("executing activity");
        match call {
            ActivityCall::LoadDag { workflow_id } => {
                let row = self.store.get_workflow(*workflow_id).await.map_err(db_error)?;
                Ok(row.dag_json)
            }
            ActivityCall::HttpRequest(input) => {
                let output = self.http.send(input).await?;
                serde_json::to_value(output).map_err(|e| NodeError::Fatal(e.to_string()))
            }
            ActivityCall::UpdateExecutionStatus { execution_id, status } => {
                let changed = self
                    .store
                    .update_execution_status(*execution_id, *status)
                    .await
                    .map_err(db_error)?;
                if !changed {
                    debug!(%execution_id, %status, "status transition was a no-op");
                }
                Ok(Value::Null)
            }
            ActivityCall::StoreExecutionResult { execution_id, result } => {
                self.store
                    .complete_execution(*execution_id, result)
                    .await
                    .map_err(db_error)?;
                Ok(Value::Null)
            }
            ActivityCall::StoreExecutionError { execution_id, error } => {
                self.store
                    .fail_execution(*execution_id, error)
                    .await
                    .map_err(db_error)?;
                Ok(Value::Null)
            }
            ActivityCall::CodeExecution(input) => {
                let output = self.sandbox.execute(input).await;
                match output.error {
                    Some(message) => Err(NodeError::Fatal(message)),
                    None => Ok(output.result),
                }
            }
        }
    }
}

fn db_error(err: DbError) -> NodeError {
    match err {
        DbError::NotFound => NodeError::Fatal("workflow not found".to_owned()),
        e if e.is_transient() => NodeError::Retryable(e.to_string()),
        e => NodeError::Fatal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;
    use serde_json::json;

    fn activities(store: Arc<MemoryStore>) -> DefaultActivities {
        DefaultActivities::new(store, HttpClient::new().unwrap(), Sandbox::new())
    }

    #[test]
    fn input_json_strips_the_tag() {
        let id = Uuid::nil();
        let call = ActivityCall::UpdateExecutionStatus {
            execution_id: id,
            status: ExecutionStatus::Running,
        };
        assert_eq!(
            call.input_json().unwrap(),
            json!({"execution_id": id, "status": "RUNNING"})
        );
        assert_eq!(call.name(), "UpdateExecutionStatus");
    }

    #[tokio::test]
    async fn load_dag_reads_the_stored_graph() {
        let store = Arc::new(MemoryStore::new());
        let dag = json!({"nodes": [], "edges": []});
        let wf = store.insert_workflow("wf", &dag).await.unwrap();

        let out = activities(store)
            .execute(&ActivityCall::LoadDag { workflow_id: wf.id })
            .await
            .unwrap();
        assert_eq!(out, dag);
    }

    #[tokio::test]
    async fn load_dag_of_missing_workflow_is_fatal() {
        let err = activities(Arc::new(MemoryStore::new()))
            .execute(&ActivityCall::LoadDag { workflow_id: Uuid::new_v4() })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn status_and_result_writes_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        let wf = store.insert_workflow("wf", &json!({})).await.unwrap();
        let execution_id = Uuid::new_v4();
        store.create_execution(execution_id, wf.id, "q").await.unwrap();
        let acts = activities(store.clone());

        acts.execute(&ActivityCall::UpdateExecutionStatus {
            execution_id,
            status: ExecutionStatus::Running,
        })
        .await
        .unwrap();
        acts.execute(&ActivityCall::StoreExecutionResult {
            execution_id,
            result: json!({"ok": 1}),
        })
        .await
        .unwrap();

        let row = store.get_execution(execution_id).await.unwrap();
        assert_eq!(row.status(), ExecutionStatus::Completed);
        assert_eq!(row.result_json, Some(json!({"ok": 1})));
    }

    #[tokio::test]
    async fn code_error_is_fatal() {
        let err = activities(Arc::new(MemoryStore::new()))
            .execute(&ActivityCall::CodeExecution(CodeExecutionInput {
                code: "throw new Error('boom')".into(),
                input: json!({}),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Fatal(ref m) if m.contains("boom")));
    }
}
