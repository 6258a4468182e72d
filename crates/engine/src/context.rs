//! Durable execution context.
//!
//! Every activity call made by an orchestration takes the next sequence
//! number. The outcome of the call (output, or the error left after the
//! retry policy gave up) is appended to the execution's activity history.
//! When a run resumes after a crash, calls whose `seq` is already in the
//! history get the recorded outcome back instead of running again, so the
//! orchestration fast-forwards to where it stopped.
//!
//! Cancellation outcomes are never recorded: a resumed run decides again.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use db::{Store, models::ActivityEventRow};
use nodes::NodeError;

use crate::{
    EngineError,
    activities::{Activities, ActivityCall},
    executor::ExecutorConfig,
};

enum Failure {
    Cancelled,
    Failed(String),
}

pub struct DurableContext<'a> {
    execution_id: Uuid,
    store: &'a dyn Store,
    activities: &'a dyn Activities,
    config: &'a ExecutorConfig,
    cancel: CancellationToken,
    history: HashMap<i32, ActivityEventRow>,
    next_seq: i32,
    replayed: usize,
}

impl<'a> DurableContext<'a> {
    /// Load the execution's history and position the context at `seq` 0.
    pub async fn load(
        execution_id: Uuid,
        store: &'a dyn Store,
        activities: &'a dyn Activities,
        config: &'a ExecutorConfig,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let history: HashMap<i32, ActivityEventRow> = store
            .load_history(execution_id)
            .await?
            .into_iter()
            .map(|event| (event.seq, event))
            .collect();

        if !history.is_empty() {
            debug!(%execution_id, events = history.len(), "resuming from recorded history");
        }

        Ok(Self {
            execution_id,
            store,
            activities,
            config,
            cancel,
            history,
            next_seq: 0,
            replayed: 0,
        })
    }

    /// Number of calls answered from history so far.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Invoke an activity, honouring the run's cancellation token.
    pub async fn call(&mut self, call: ActivityCall) -> Result<Value, EngineError> {
        let token = self.cancel.clone();
        self.call_with(call, &token).await
    }

    /// Invoke an activity that must run even when the run is cancelled.
    pub async fn call_detached(&mut self, call: ActivityCall) -> Result<Value, EngineError> {
        self.call_with(call, &CancellationToken::new()).await
    }

    async fn call_with(
        &mut self,
        call: ActivityCall,
        token: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let activity = call.name();

        if let Some(event) = self.history.remove(&seq) {
            debug!(seq, activity, "replaying recorded outcome");
            self.replayed += 1;
            return outcome(event, activity);
        }

        let (output, error) = match self.run_with_retry(&call, token).await {
            Ok(output) => (Some(output), None),
            Err(Failure::Failed(message)) => (None, Some(message)),
            Err(Failure::Cancelled) => return Err(EngineError::Cancelled),
        };
        let event = self.record(seq, &call, output, error).await?;
        outcome(event, activity)
    }

    async fn run_with_retry(
        &self,
        call: &ActivityCall,
        token: &CancellationToken,
    ) -> Result<Value, Failure> {
        let policy = &self.config.retry;
        let timeout = self.config.timeouts.for_call(call);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if token.is_cancelled() {
                return Err(Failure::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Failure::Cancelled),
                r = tokio::time::timeout(timeout, self.activities.execute(call)) => r,
            };

            let err = match result {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(err)) => err,
                Err(_) => NodeError::Retryable(format!("activity timed out after {timeout:?}")),
            };

            match err {
                NodeError::Fatal(message) => return Err(Failure::Failed(message)),
                NodeError::Retryable(message) if attempt >= policy.max_attempts => {
                    warn!(
                        activity = call.name(),
                        attempt, "activity exhausted its retries: {}", message
                    );
                    return Err(Failure::Failed(message));
                }
                NodeError::Retryable(message) => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        "activity '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        call.name(),
                        attempt,
                        policy.max_attempts,
                        delay,
                        message
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(Failure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Append the outcome at `seq` and return the event that ended up in
    /// the history. When another worker recorded `seq` first, its event wins.
    async fn record(
        &self,
        seq: i32,
        call: &ActivityCall,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<ActivityEventRow, EngineError> {
        let event = ActivityEventRow {
            execution_id: self.execution_id,
            seq,
            activity: call.name().to_owned(),
            input_json: call.input_json()?,
            output_json: output,
            error,
            recorded_at: Utc::now(),
        };
        if self.store.append_history(&event).await? {
            return Ok(event);
        }

        warn!(seq, activity = call.name(), "outcome already recorded, using the stored one");
        match self.store.get_history_event(self.execution_id, seq).await? {
            Some(stored) => Ok(stored),
            None => Ok(event),
        }
    }
}

/// Turn a history event into the call's result.
fn outcome(event: ActivityEventRow, activity: &'static str) -> Result<Value, EngineError> {
    if event.activity != activity {
        return Err(EngineError::NonDeterminism {
            seq: event.seq,
            recorded: event.activity,
            called: activity,
        });
    }
    match event.error {
        Some(message) => Err(EngineError::Activity { activity, message }),
        None => Ok(event.output_json.unwrap_or(Value::Null)),
    }
}
