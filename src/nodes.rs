//! Built-in node types available to workflows run from the CLI.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use trellis_invoker::{ExecutionMode, NodeContext, NodeImplementation, StaticRegistry};
use trellis_store::{LogLevel, NodeError};

pub fn registry() -> StaticRegistry {
  StaticRegistry::new()
    .with("noop", Noop)
    .with("set", Set)
    .with("delay", Delay)
    .with("fail", Fail)
    .with("log", Log)
}

/// Forwards its upstream data unchanged.
struct Noop;

#[async_trait]
impl NodeImplementation for Noop {
  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    Ok(ctx.upstream.clone())
  }
}

/// Outputs its resolved config.
struct Set;

#[async_trait]
impl NodeImplementation for Set {
  async fn execute(&self, input: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
    Ok(input)
  }
}

/// Waits `ms` milliseconds, or until the execution is cancelled.
struct Delay;

#[async_trait]
impl NodeImplementation for Delay {
  fn mode(&self) -> ExecutionMode {
    ExecutionMode::Async
  }

  async fn execute(&self, input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    let ms = input
      .get("ms")
      .and_then(Value::as_u64)
      .ok_or_else(|| NodeError::configuration("delay requires an integer 'ms'"))?;

    tokio::select! {
      _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ctx.upstream.clone()),
      _ = ctx.cancellation().cancelled() => Err(NodeError::cancelled()),
    }
  }
}

/// Always fails with `message`. `fatal: true` rules out retries.
struct Fail;

#[async_trait]
impl NodeImplementation for Fail {
  async fn execute(&self, input: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
    let message = input
      .get("message")
      .and_then(Value::as_str)
      .unwrap_or("failed on purpose");
    let error = NodeError::runtime(message);
    if input.get("fatal").and_then(Value::as_bool).unwrap_or(false) {
      Err(error.fatal())
    } else {
      Err(error)
    }
  }
}

/// Writes `message` to the execution log at `level` (default info).
struct Log;

#[async_trait]
impl NodeImplementation for Log {
  async fn execute(&self, input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    let message = match input.get("message") {
      Some(Value::String(s)) => s.clone(),
      Some(other) => other.to_string(),
      None => return Err(NodeError::configuration("log requires a 'message'")),
    };
    let level = match input.get("level").and_then(Value::as_str).unwrap_or("info") {
      "debug" => LogLevel::Debug,
      "info" => LogLevel::Info,
      "warn" => LogLevel::Warn,
      "error" => LogLevel::Error,
      other => {
        return Err(NodeError::configuration(format!("unknown log level '{}'", other)));
      }
    };

    ctx.logger().log(level, message.clone(), Value::Null);
    Ok(json!({ "logged": message }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use trellis_engine::{Engine, InMemoryWorkflows};
  use trellis_store::{ErrorKind, ExecutionStatus};
  use trellis_workflow::Workflow;

  fn engine_with(json: serde_json::Value) -> Engine {
    let workflow = Workflow::from_json(&json.to_string()).unwrap();
    let workflows = InMemoryWorkflows::new();
    workflows.insert(workflow);
    Engine::builder(Arc::new(registry()))
      .workflows(Arc::new(workflows))
      .build()
  }

  #[tokio::test]
  async fn test_demo_nodes_chain() {
    let engine = engine_with(json!({
      "workflow_id": "demo",
      "name": "Demo",
      "nodes": [
        { "node_id": "greeting", "type": "set", "config": { "text": "hi {{ trigger.name }}" } },
        { "node_id": "say", "type": "log", "config": { "message": "{{ nodes.greeting.text }}", "level": "warn" } },
        { "node_id": "wait", "type": "delay", "config": { "ms": 1 } },
        { "node_id": "done", "type": "noop" }
      ],
      "connections": [
        { "source": "greeting", "target": "say" },
        { "source": "say", "target": "wait" },
        { "source": "wait", "target": "done" }
      ]
    }));

    let id = engine
      .start_execution("demo", None, json!({ "name": "ada" }))
      .await
      .unwrap();
    let execution = engine.wait_for_completion(&id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);

    let states = engine.get_node_states(&id).await.unwrap();
    let done = states.iter().find(|s| s.node_id == "done").unwrap();
    assert_eq!(done.output, Some(json!({ "logged": "hi ada" })));

    let logs = engine.get_execution_logs(&id, None).await.unwrap();
    assert!(
      logs
        .iter()
        .any(|l| l.message == "hi ada" && l.level == LogLevel::Warn)
    );
  }

  #[tokio::test]
  async fn test_fatal_fail_is_not_retried() {
    let engine = engine_with(json!({
      "workflow_id": "broken",
      "name": "Broken",
      "settings": { "default_retry": { "enabled": true, "max_retries": 3 } },
      "nodes": [
        { "node_id": "a", "type": "fail", "config": { "message": "nope", "fatal": true } }
      ]
    }));

    let id = engine.start_execution("broken", None, json!({})).await.unwrap();
    let execution = engine.wait_for_completion(&id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let states = engine.get_node_states(&id).await.unwrap();
    let error = states[0].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert!(error.fatal);
    assert_eq!(states[0].retry_count, 0);
  }
}
