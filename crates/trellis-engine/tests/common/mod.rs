//! Test nodes and workflow builders shared by the engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Barrier, Notify};
use tokio::time::Instant;
use trellis_config::{ConnectionDef, NodeDef, WorkflowDef, WorkflowSettings};
use trellis_engine::{Engine, EngineError, InMemoryWorkflows};
use trellis_invoker::{ExecutionMode, NodeContext, NodeImplementation, StaticRegistry};
use trellis_store::{NodeError, NodeState, NodeStatus};
use trellis_workflow::Workflow;

/// Returns its resolved config.
pub struct SetNode;

#[async_trait]
impl NodeImplementation for SetNode {
  async fn execute(&self, input: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
    Ok(input)
  }
}

/// Returns the upstream data it received.
pub struct PassthroughNode;

#[async_trait]
impl NodeImplementation for PassthroughNode {
  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    Ok(ctx.upstream.clone())
  }
}

/// Records which nodes ran, in order.
#[derive(Clone, Default)]
pub struct RecordNode {
  pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordNode {
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl NodeImplementation for RecordNode {
  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    self.calls.lock().unwrap().push(ctx.node_id.clone());
    Ok(json!({ "node": ctx.node_id }))
  }
}

/// Fails with a retryable runtime error the first `failures` times, then
/// succeeds. Records the instant of every attempt.
#[derive(Clone)]
pub struct FlakyNode {
  remaining: Arc<AtomicU32>,
  pub attempts: Arc<Mutex<Vec<Instant>>>,
}

impl FlakyNode {
  pub fn new(failures: u32) -> Self {
    Self {
      remaining: Arc::new(AtomicU32::new(failures)),
      attempts: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn always() -> Self {
    Self::new(u32::MAX)
  }

  pub fn attempts(&self) -> Vec<Instant> {
    self.attempts.lock().unwrap().clone()
  }
}

#[async_trait]
impl NodeImplementation for FlakyNode {
  async fn execute(&self, _input: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
    self.attempts.lock().unwrap().push(Instant::now());
    let left = self
      .remaining
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    match left {
      Ok(_) => Err(NodeError::runtime("boom")),
      Err(_) => Ok(json!({ "ok": true })),
    }
  }
}

/// Runs until the execution is cancelled.
pub struct BlockNode;

#[async_trait]
impl NodeImplementation for BlockNode {
  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    ctx.cancellation().cancelled().await;
    Err(NodeError::cancelled())
  }
}

/// Sleeps for `config.ms` milliseconds.
pub struct SleepNode;

#[async_trait]
impl NodeImplementation for SleepNode {
  async fn execute(&self, input: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
    let ms = input["ms"].as_u64().unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!({ "slept_ms": ms }))
  }
}

/// Waits until every node sharing the barrier has arrived.
pub struct BarrierNode(pub Arc<Barrier>);

#[async_trait]
impl NodeImplementation for BarrierNode {
  fn mode(&self) -> ExecutionMode {
    ExecutionMode::Async
  }

  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    self.0.wait().await;
    Ok(json!({ "node": ctx.node_id }))
  }
}

/// Waits for a permit on the notify before succeeding.
pub struct GateNode(pub Arc<Notify>);

#[async_trait]
impl NodeImplementation for GateNode {
  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    ctx.logger().info("waiting at gate");
    self.0.notified().await;
    Ok(json!({ "opened": true }))
  }
}

/// Returns the data of the credential bound to the `api` slot.
pub struct CredentialNode;

#[async_trait]
impl NodeImplementation for CredentialNode {
  async fn execute(&self, _input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
    let credential = ctx.credential("api").await?;
    Ok(credential.data)
  }
}

pub fn registry() -> StaticRegistry {
  StaticRegistry::new()
    .with("set", SetNode)
    .with("passthrough", PassthroughNode)
    .with("block", BlockNode)
    .with("sleep", SleepNode)
    .with("credential", CredentialNode)
}

pub fn workflow(workflow_id: &str, nodes: Vec<NodeDef>, edges: &[(&str, &str)]) -> Workflow {
  workflow_with(workflow_id, WorkflowSettings::default(), nodes, edges)
}

pub fn workflow_with(
  workflow_id: &str,
  settings: WorkflowSettings,
  nodes: Vec<NodeDef>,
  edges: &[(&str, &str)],
) -> Workflow {
  let def = WorkflowDef {
    workflow_id: workflow_id.to_string(),
    version: 1,
    name: workflow_id.to_string(),
    variables: serde_json::Map::new(),
    settings,
    nodes,
    connections: edges
      .iter()
      .map(|(source, target)| ConnectionDef::new(*source, *target))
      .collect(),
  };
  Workflow::from_def(def).expect("test workflow is valid")
}

pub fn engine(registry: StaticRegistry, workflows: Vec<Workflow>) -> Engine {
  let source = InMemoryWorkflows::new();
  for workflow in workflows {
    source.insert(workflow);
  }
  Engine::builder(Arc::new(registry))
    .workflows(Arc::new(source))
    .build()
}

pub fn state<'a>(states: &'a [NodeState], node_id: &str) -> &'a NodeState {
  states
    .iter()
    .find(|s| s.node_id == node_id)
    .unwrap_or_else(|| panic!("no state for node '{}'", node_id))
}

/// Poll until `node_id` reaches `status`.
pub async fn wait_for_node(
  engine: &Engine,
  execution_id: &str,
  node_id: &str,
  status: NodeStatus,
) -> Result<(), EngineError> {
  loop {
    let states = engine.get_node_states(execution_id).await?;
    if state(&states, node_id).status == status {
      return Ok(());
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}
