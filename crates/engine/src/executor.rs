//! Workflow execution engine.
//!
//! `WorkflowExecutor` runs the orchestration for one execution:
//! 1. Loads the DAG and validates it.
//! 2. Marks the execution `RUNNING` and orders the nodes topologically.
//! 3. Walks the order, dispatching `http` and `code` nodes as activities and
//!    passing the previous node's output along.
//! 4. Persists the final result, or the error that stopped the run.
//!
//! The orchestration body is deterministic: everything with a side effect
//! (store, network, sandbox, clock) goes through the [`DurableContext`], so
//! a resumed run issues the same calls in the same order.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use db::{Store, models::ExecutionStatus};
use nodes::NodeKind;

use crate::{
    EngineError,
    activities::{Activities, ActivityCall, ActivityTimeouts},
    context::DurableContext,
    dag,
    models::{Dag, Node},
    retry::RetryPolicy,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub timeouts: ActivityTimeouts,
}

// ---------------------------------------------------------------------------
// Output of a completed execution
// ---------------------------------------------------------------------------

/// The result of running a full workflow.
#[derive(Debug)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    /// Output of the last node that produced one, if any did.
    pub output: Option<Value>,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Stateless orchestrator; one per process is enough.
pub struct WorkflowExecutor {
    store: Arc<dyn Store>,
    activities: Arc<dyn Activities>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn Store>, activities: Arc<dyn Activities>, config: ExecutorConfig) -> Self {
        Self { store, activities, config }
    }

    /// Run (or resume) the execution.
    ///
    /// On failure the execution has already been marked `FAILED` with the
    /// error's message, unless the failure was in writing that status. A
    /// retryable error (see [`EngineError::is_retryable`]) leaves the
    /// execution untouched so the next attempt can resume it.
    ///
    /// # Errors
    /// Returns `EngineError` for validation failures, failed activities,
    /// cancellation, replay divergence or database problems.
    #[instrument(skip_all, fields(%workflow_id, %execution_id))]
    pub async fn run(
        &self,
        workflow_id: Uuid,
        execution_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let mut ctx = DurableContext::load(
            execution_id,
            self.store.as_ref(),
            self.activities.as_ref(),
            &self.config,
            cancel,
        )
        .await?;

        match orchestrate(&mut ctx, workflow_id, execution_id).await {
            Ok(output) => {
                info!(replayed = ctx.replayed(), "execution completed");
                Ok(ExecutionResult { execution_id, output })
            }
            Err(err) if err.is_retryable() => {
                warn!("execution interrupted, leaving it for another attempt: {}", err);
                Err(err)
            }
            Err(err) => {
                error!("execution failed: {}", err);
                let store_error = ActivityCall::StoreExecutionError {
                    execution_id,
                    error: err.to_string(),
                };
                if let Err(write_err) = ctx.call_detached(store_error).await {
                    error!("could not record execution failure: {}", write_err);
                }
                Err(err)
            }
        }
    }
}

async fn orchestrate(
    ctx: &mut DurableContext<'_>,
    workflow_id: Uuid,
    execution_id: Uuid,
) -> Result<Option<Value>, EngineError> {
    // ------------------------------------------------------------------
    // Load and validate the DAG.
    // ------------------------------------------------------------------
    let dag_json = ctx.call(ActivityCall::LoadDag { workflow_id }).await?;
    let dag = Dag::from_json(&dag_json)?;

    let errors = dag::validate(&dag);
    if !errors.is_empty() {
        return Err(EngineError::Validation(errors));
    }

    ctx.call(ActivityCall::UpdateExecutionStatus {
        execution_id,
        status: ExecutionStatus::Running,
    })
    .await?;

    let order = dag::topological_order(&dag)?;
    info!("DAG validated — executing {} nodes in order: {:?}", order.len(), order);

    // ------------------------------------------------------------------
    // Execute nodes sequentially.
    // ------------------------------------------------------------------
    let mut last: Option<Value> = None;

    for node_id in &order {
        let Some(node) = dag::get_node_by_id(&dag, node_id) else {
            continue;
        };
        let kind = node.kind().map_err(|issues| EngineError::InvalidNode {
            node_id: node.id.clone(),
            message: issues
                .iter()
                .map(|i| i.describe(&node.id))
                .collect::<Vec<_>>()
                .join("; "),
        })?;

        match kind {
            NodeKind::Start(_) => {
                last = Some(json!({ "start": node.id }));
            }
            NodeKind::Http(data) => {
                let output = ctx
                    .call(ActivityCall::HttpRequest((&data).into()))
                    .await
                    .map_err(|e| node_failure(node, e))?;
                last = Some(output);
            }
            NodeKind::Code(data) => {
                let input = nodes::CodeExecutionInput {
                    code: data.code,
                    input: last.clone().unwrap_or(Value::Null),
                };
                let output = ctx
                    .call(ActivityCall::CodeExecution(input))
                    .await
                    .map_err(|e| node_failure(node, e))?;
                last = Some(output);
            }
            NodeKind::Output(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Persist the outcome.
    // ------------------------------------------------------------------
    match &last {
        Some(result) => {
            ctx.call(ActivityCall::StoreExecutionResult {
                execution_id,
                result: result.clone(),
            })
            .await?;
        }
        None => {
            ctx.call(ActivityCall::UpdateExecutionStatus {
                execution_id,
                status: ExecutionStatus::Completed,
            })
            .await?;
        }
    }

    Ok(last)
}

fn node_failure(node: &Node, err: EngineError) -> EngineError {
    match err {
        EngineError::Activity { activity, message } => EngineError::Activity {
            activity,
            message: format!("{} node '{}' failed: {}", node.node_type, node.id, message),
        },
        other => other,
    }
}
