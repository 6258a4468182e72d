//! JavaScript evaluation for `code` nodes.
//!
//! User code sees the previous node's output as the globals `response` and
//! `data` and nothing else: no network, no filesystem, no host objects.
//!
//! Each evaluation gets its own QuickJS runtime on the blocking pool. The
//! runtime's interrupt handler aborts the script once its deadline passes,
//! so the evaluation thread stops with the caller, and a memory cap bounds
//! what a script can allocate.

use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, Context, Ctx, Runtime, Value as JsValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Wall-clock bound for one evaluation.
pub const SANDBOX_TIMEOUT: Duration = Duration::from_secs(5);

const MEMORY_LIMIT: usize = 64 * 1024 * 1024;
const MAX_STACK_SIZE: usize = 512 * 1024;

/// How long the caller waits past the deadline for the interrupted thread
/// to hand back its result.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionInput {
    #[serde(default)]
    pub code: String,
    /// Output of the previous node.
    #[serde(default)]
    pub input: Value,
}

/// Either `result` or `error` is meaningful; a set `error` means failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionOutput {
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CodeExecutionOutput {
    fn ok(result: Value) -> Self {
        Self { result, error: None }
    }

    fn err(message: impl Into<String>) -> Self {
        Self { result: Value::Null, error: Some(message.into()) }
    }
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self { timeout: SANDBOX_TIMEOUT }
    }
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Evaluate `input.code` against `input.input`.
    ///
    /// Never fails as a call; script problems come back in
    /// [`CodeExecutionOutput::error`].
    pub async fn execute(&self, input: &CodeExecutionInput) -> CodeExecutionOutput {
        if input.code.trim().is_empty() {
            return CodeExecutionOutput::ok(input.input.clone());
        }

        let source = wrap(&input.code);
        let value = input.input.clone();
        let timeout = self.timeout;
        let handle = tokio::task::spawn_blocking(move || evaluate(&source, &value, timeout));

        match tokio::time::timeout(timeout + INTERRUPT_GRACE, handle).await {
            Err(_) => {
                warn!(?timeout, "code execution did not stop at its deadline");
                CodeExecutionOutput::err(timeout_message(timeout))
            }
            Ok(Err(join)) if join.is_panic() => {
                CodeExecutionOutput::err("code execution error: panic during execution")
            }
            Ok(Err(join)) => CodeExecutionOutput::err(format!("code execution error: {join}")),
            Ok(Ok(Ok(result))) => CodeExecutionOutput::ok(result),
            Ok(Ok(Err(message))) => CodeExecutionOutput::err(message),
        }
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("code execution timeout ({}s)", timeout.as_secs())
}

/// Scripts with a `return` are treated as function bodies; anything else
/// runs for its side effects on `response` and returns it.
pub fn wrap(code: &str) -> String {
    if code.contains("return") {
        format!("(function() {{\n{code}\n}})()")
    } else {
        format!("(function() {{\n{code}\nreturn response;\n}})()")
    }
}

/// Run `source` to completion or until `timeout` has elapsed, on the
/// calling thread.
pub fn evaluate(source: &str, input: &Value, timeout: Duration) -> Result<Value, String> {
    let started = Instant::now();
    let deadline = started + timeout;

    let runtime = Runtime::new().map_err(|e| format!("failed to start sandbox: {e}"))?;
    runtime.set_memory_limit(MEMORY_LIMIT);
    runtime.set_max_stack_size(MAX_STACK_SIZE);
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));
    let context = Context::full(&runtime).map_err(|e| format!("failed to start sandbox: {e}"))?;

    let result = context.with(|ctx| run_script(&ctx, source, input));
    match result {
        Err(_) if Instant::now() >= deadline => {
            warn!(elapsed = ?started.elapsed(), "code execution interrupted at its deadline");
            Err(timeout_message(timeout))
        }
        Err(message) => Err(message),
        Ok(value) => {
            debug!(elapsed = ?started.elapsed(), "code execution finished");
            Ok(value)
        }
    }
}

fn run_script(ctx: &Ctx<'_>, source: &str, input: &Value) -> Result<Value, String> {
    let bind = || -> rquickjs::Result<()> {
        let value = ctx.json_parse(input.to_string())?;
        let globals = ctx.globals();
        globals.set("response", value.clone())?;
        globals.set("data", value)?;
        Ok(())
    };
    bind()
        .catch(ctx)
        .map_err(|e| format!("failed to bind input: {e}"))?;

    let result: JsValue = ctx
        .eval(source)
        .catch(ctx)
        .map_err(|e| format!("code execution error: {e}"))?;

    if result.is_undefined() {
        return Err("code must return a value (result is undefined)".to_owned());
    }

    let json = ctx
        .json_stringify(result)
        .catch(ctx)
        .map_err(|e| format!("failed to export result: {e}"))?
        .ok_or_else(|| "failed to export result: value has no JSON form".to_owned())?
        .to_string()
        .map_err(|e| format!("failed to export result: {e}"))?;
    serde_json::from_str(&json).map_err(|e| format!("failed to export result: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(code: &str, input: Value) -> CodeExecutionOutput {
        Sandbox::new()
            .execute(&CodeExecutionInput { code: code.into(), input })
            .await
    }

    #[tokio::test]
    async fn blank_code_passes_input_through() {
        for input in [json!(null), json!(1), json!("s"), json!([1, 2]), json!({"a": {"b": true}})] {
            let out = run("  \n\t", input.clone()).await;
            assert_eq!(out, CodeExecutionOutput::ok(input));
        }
    }

    #[tokio::test]
    async fn explicit_return_is_used() {
        let out = run("return data.x + 1;", json!({"x": 41})).await;
        assert_eq!(out.result, json!(42));
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn script_without_return_yields_response() {
        let out = run("response.seen = true;", json!({"x": 1})).await;
        assert_eq!(out.result, json!({"x": 1, "seen": true}));
    }

    #[tokio::test]
    async fn thrown_error_is_reported() {
        let out = run("throw new Error('boom')", json!({})).await;
        let error = out.error.expect("error expected");
        assert!(error.starts_with("code execution error:"));
        assert!(error.contains("boom"));
    }

    #[tokio::test]
    async fn undefined_result_is_an_error() {
        let out = run("return undefined;", json!({})).await;
        assert!(out.error.unwrap().contains("code must return a value"));
    }

    #[tokio::test]
    async fn null_result_is_valid() {
        let out = run("return null;", json!({"x": 1})).await;
        assert_eq!(out, CodeExecutionOutput::ok(Value::Null));
    }

    #[tokio::test]
    async fn arrays_and_objects_are_exported() {
        let out = run("return data.items.map(i => ({ v: i * 2 }));", json!({"items": [1, 2]})).await;
        assert_eq!(out.result, json!([{"v": 2}, {"v": 4}]));
    }

    #[tokio::test]
    async fn syntax_error_is_reported() {
        let out = run("return {;", json!({})).await;
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn runaway_loop_is_stopped() {
        let out = Sandbox::with_timeout(Duration::from_millis(200))
            .execute(&CodeExecutionInput { code: "while (true) {}".into(), input: json!(null) })
            .await;
        assert_eq!(out.error.as_deref(), Some("code execution timeout (0s)"));
    }

    #[test]
    fn nested_loops_stop_the_evaluation_thread_at_the_deadline() {
        let source = wrap(
            "for (let i = 0; i < 1e6; i++) { for (let j = 0; j < 1e6; j++) {} } return 1;",
        );
        let (tx, rx) = std::sync::mpsc::channel();
        let started = Instant::now();
        let thread = std::thread::spawn(move || {
            let result = evaluate(&source, &json!(null), Duration::from_millis(200));
            let _ = tx.send(result);
        });

        // the thread itself returns, not just the caller
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("evaluation thread kept running past its deadline");
        thread.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result, Err("code execution timeout (0s)".to_owned()));
    }

    #[test]
    fn interrupted_script_cannot_catch_the_deadline() {
        let source = wrap("while (true) { try { while (true) {} } catch (e) {} }");
        let result = evaluate(&source, &json!(null), Duration::from_millis(100));
        assert_eq!(result, Err("code execution timeout (0s)".to_owned()));
    }
}
