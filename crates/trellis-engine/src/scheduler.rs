//! Per-execution scheduler.
//!
//! One [`Scheduler`] drives one execution. It is the only writer of the
//! execution's node states: it dispatches ready nodes onto their own tasks,
//! waits on a completion channel, records results through the store's
//! compare-and-set transitions and re-evaluates readiness after every
//! completion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use trellis_expression::{ExecutionMeta, Scope, WorkflowMeta};
use trellis_invoker::Invocation;
use trellis_store::{
  Execution, ExecutionStatus, LogLevel, NodeError, NodeStatus, NodeTransition, StoreError,
};
use trellis_workflow::{Node, Workflow};

use crate::EngineError;
use crate::engine::Shared;

/// Where a node stands from the scheduler's point of view.
#[derive(Debug, Clone)]
enum Phase {
  Pending,
  Running,
  /// Failed, waiting out the retry delay.
  Backoff,
  /// Retry delay elapsed, waiting for dispatch.
  RetryDue,
  Succeeded(Value),
  /// Terminal failure.
  Failed(NodeError),
  /// `passthrough` carries a disabled node's input on to its downstream.
  Skipped { passthrough: Option<Value> },
}

type Outcome = Result<Result<Value, NodeError>, StoreError>;

enum Message {
  Finished { node_id: String, outcome: Outcome },
  RetryDue { node_id: String },
}

enum Readiness {
  Waiting,
  Ready(Value),
  Disabled(Value),
  Skip(String),
}

enum Wake {
  Message(Option<Message>),
  Cancelled,
  PauseChanged(bool),
  DeadlineElapsed,
}

pub(crate) struct Scheduler {
  shared: Arc<Shared>,
  workflow: Arc<Workflow>,
  execution: Execution,
  /// Topological order, so that one pass cascades skips downstream.
  order: Vec<String>,
  phases: HashMap<String, Phase>,
  /// Input of each node's latest attempt, reused by retries.
  inputs: HashMap<String, Value>,
  cancel: CancellationToken,
  paused: watch::Receiver<bool>,
  tx: mpsc::UnboundedSender<Message>,
  rx: mpsc::UnboundedReceiver<Message>,
  in_flight: usize,
  /// Error of the first node whose failure halted the run.
  halt: Option<String>,
  /// Descendants of the halting failures. Once halted, only these may
  /// still dispatch.
  halt_region: HashSet<String>,
  timed_out: bool,
}

impl Scheduler {
  pub(crate) fn new(
    shared: Arc<Shared>,
    workflow: Arc<Workflow>,
    execution: Execution,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
  ) -> Self {
    let graph = workflow.graph();
    let order = graph
      .topological_order()
      .unwrap_or_else(|_| graph.node_ids().to_vec());
    let phases = order.iter().map(|id| (id.clone(), Phase::Pending)).collect();
    let (tx, rx) = mpsc::unbounded_channel();

    Self {
      shared,
      workflow,
      execution,
      order,
      phases,
      inputs: HashMap::new(),
      cancel,
      paused,
      tx,
      rx,
      in_flight: 0,
      halt: None,
      halt_region: HashSet::new(),
      timed_out: false,
    }
  }

  fn execution_id(&self) -> &str {
    &self.execution.execution_id
  }

  /// Drive the execution to a terminal status.
  #[instrument(
    name = "workflow_execute",
    skip(self),
    fields(
      execution_id = %self.execution.execution_id,
      workflow_id = %self.workflow.workflow_id,
    )
  )]
  pub(crate) async fn run(mut self) -> Result<Execution, EngineError> {
    let store = self.shared.store.clone();
    let execution_id = self.execution.execution_id.clone();

    match store
      .update_execution_status(
        &execution_id,
        &[ExecutionStatus::Pending],
        ExecutionStatus::Running,
        None,
      )
      .await
    {
      Ok(_) => {}
      // Cancelled before the first pass.
      Err(StoreError::Conflict { .. }) => return Ok(store.get_execution(&execution_id).await?),
      Err(e) => return Err(e.into()),
    }

    info!(
      execution_id = %execution_id,
      workflow_id = %self.workflow.workflow_id,
      trigger_payload = %self.execution.trigger_payload,
      "workflow_started"
    );
    self.shared.emitter.execution_updated(
      &execution_id,
      ExecutionStatus::Running,
      format!(
        "execution of '{}' v{} started",
        self.workflow.workflow_id, self.workflow.version
      ),
    );

    let deadline = self
      .workflow
      .settings
      .execution_timeout_ms
      .map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut pause_open = true;

    loop {
      self.advance().await?;
      if self.is_finished() {
        break;
      }

      let wake = tokio::select! {
        message = self.rx.recv() => Wake::Message(message),
        _ = self.cancel.cancelled(), if !self.cancel.is_cancelled() => Wake::Cancelled,
        changed = self.paused.changed(), if pause_open => Wake::PauseChanged(changed.is_ok()),
        _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
          if deadline.is_some() && !self.timed_out => Wake::DeadlineElapsed,
      };

      match wake {
        Wake::Message(Some(message)) => self.handle(message).await?,
        Wake::Message(None) => {}
        Wake::Cancelled => {
          warn!(execution_id = %execution_id, in_flight = self.in_flight, "workflow_cancel_observed");
        }
        Wake::PauseChanged(open) => pause_open = open,
        Wake::DeadlineElapsed => {
          warn!(execution_id = %execution_id, "workflow_timed_out");
          self.timed_out = true;
          self.cancel.cancel();
        }
      }
    }

    self.finish().await
  }

  fn is_paused(&self) -> bool {
    *self.paused.borrow()
  }

  /// Whether `node_id` may still start or retry.
  ///
  /// After a halt only descendants of the failed nodes keep running, so
  /// that continue-on-error nodes see the failure.
  fn may_dispatch(&self, node_id: &str) -> bool {
    !self.cancel.is_cancelled() && (self.halt.is_none() || self.halt_region.contains(node_id))
  }

  fn is_finished(&self) -> bool {
    if self.in_flight > 0 {
      return false;
    }
    if self.cancel.is_cancelled() {
      return true;
    }
    let mut phases = self
      .phases
      .iter()
      .filter(|(id, _)| self.may_dispatch(id))
      .map(|(_, phase)| phase);
    if phases.clone().any(|p| matches!(p, Phase::Backoff)) {
      return false;
    }
    // Paused with work left: wait for resume or cancel.
    !(self.is_paused() && phases.any(|p| matches!(p, Phase::Pending | Phase::RetryDue)))
  }

  /// Dispatch due retries and every ready node, skipping the ones that can
  /// no longer run.
  async fn advance(&mut self) -> Result<(), EngineError> {
    if self.cancel.is_cancelled() || self.is_paused() {
      return Ok(());
    }

    let due: Vec<String> = self
      .order
      .iter()
      .filter(|id| matches!(self.phases.get(*id), Some(Phase::RetryDue)) && self.may_dispatch(id))
      .cloned()
      .collect();
    for node_id in due {
      if self.cancel.is_cancelled() {
        return Ok(());
      }
      self.retry(&node_id).await?;
    }

    self.dispatch_ready().await?;
    Ok(())
  }

  /// One readiness pass over the pending nodes. Returns how many started.
  ///
  /// A node is started only after the store accepted PENDING -> RUNNING,
  /// so repeating the pass without a completion in between starts nothing.
  pub(crate) async fn dispatch_ready(&mut self) -> Result<usize, EngineError> {
    let mut dispatched = 0;

    for node_id in self.order.clone() {
      if self.cancel.is_cancelled() {
        break;
      }
      if !matches!(self.phases.get(&node_id), Some(Phase::Pending)) || !self.may_dispatch(&node_id) {
        continue;
      }

      match self.readiness(&node_id) {
        Readiness::Waiting => {}
        Readiness::Skip(reason) => self.skip(&node_id, None, reason).await?,
        Readiness::Disabled(input) => {
          self
            .skip(&node_id, Some(input), "node is disabled".to_string())
            .await?
        }
        Readiness::Ready(input) => {
          if self.start(&node_id, input).await? {
            dispatched += 1;
          }
        }
      }
    }

    if dispatched > 0 {
      debug!(execution_id = %self.execution_id(), dispatched, "executing batch of ready nodes");
    }
    Ok(dispatched)
  }

  fn readiness(&self, node_id: &str) -> Readiness {
    let Some(node) = self.workflow.get_node(node_id) else {
      return Readiness::Waiting;
    };
    let upstream = self.workflow.graph().upstream(node_id);

    let mut inputs = serde_json::Map::new();
    let mut settled = true;
    let mut blocked_by = None;

    for up in upstream {
      let value = match self.phases.get(up) {
        Some(Phase::Succeeded(output)) => output.clone(),
        Some(Phase::Skipped {
          passthrough: Some(input),
        }) => input.clone(),
        Some(Phase::Failed(error)) => {
          blocked_by.get_or_insert_with(|| format!("upstream node '{}' failed", up));
          error_input(up, error)
        }
        Some(Phase::Skipped { passthrough: None }) => {
          blocked_by.get_or_insert_with(|| format!("upstream node '{}' was skipped", up));
          Value::Null
        }
        _ => {
          settled = false;
          continue;
        }
      };
      inputs.insert(up.clone(), value);
    }

    if let Some(reason) = blocked_by {
      if !node.continue_on_error {
        return Readiness::Skip(reason);
      }
    }
    if !settled {
      return Readiness::Waiting;
    }

    let input = match upstream.len() {
      0 => self.execution.trigger_payload.clone(),
      1 => inputs.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null),
      _ => Value::Object(inputs),
    };

    if node.disabled {
      Readiness::Disabled(input)
    } else {
      Readiness::Ready(input)
    }
  }

  async fn start(&mut self, node_id: &str, input: Value) -> Result<bool, EngineError> {
    let transition = NodeTransition::Start {
      input: input.clone(),
    };
    match self
      .shared
      .store
      .transition_node(self.execution_id(), node_id, NodeStatus::Pending, transition)
      .await
    {
      Ok(_) => {}
      Err(StoreError::Conflict { actual, .. }) => {
        warn!(
          execution_id = %self.execution_id(),
          node_id = %node_id,
          actual = %actual,
          "dispatch_conflict"
        );
        return Ok(false);
      }
      Err(e) => return Err(e.into()),
    }

    self.phases.insert(node_id.to_string(), Phase::Running);
    self.inputs.insert(node_id.to_string(), input.clone());
    self.shared.emitter.node_updated(
      self.execution_id(),
      node_id,
      NodeStatus::Running,
      format!("node '{}' started", node_id),
      json!({ "attempt": 0 }),
    );
    self.spawn(node_id, input, 0);
    Ok(true)
  }

  async fn retry(&mut self, node_id: &str) -> Result<(), EngineError> {
    let input = self.inputs.get(node_id).cloned().unwrap_or(Value::Null);
    let state = self
      .shared
      .store
      .transition_node(
        self.execution_id(),
        node_id,
        NodeStatus::Failed,
        NodeTransition::Start {
          input: input.clone(),
        },
      )
      .await?;

    self.phases.insert(node_id.to_string(), Phase::Running);
    self.shared.emitter.node_updated(
      self.execution_id(),
      node_id,
      NodeStatus::Running,
      format!("node '{}' retry {} started", node_id, state.retry_count),
      json!({ "attempt": state.retry_count }),
    );
    self.spawn(node_id, input, state.retry_count);
    Ok(())
  }

  async fn skip(&mut self, node_id: &str, passthrough: Option<Value>, reason: String) -> Result<(), EngineError> {
    self
      .shared
      .store
      .transition_node(self.execution_id(), node_id, NodeStatus::Pending, NodeTransition::Skip)
      .await?;

    info!(execution_id = %self.execution_id(), node_id = %node_id, reason = %reason, "task_skipped");
    self.phases.insert(node_id.to_string(), Phase::Skipped { passthrough });
    self.shared.emitter.node_updated(
      self.execution_id(),
      node_id,
      NodeStatus::Skipped,
      format!("node '{}' skipped: {}", node_id, reason),
      json!({ "reason": reason }),
    );
    Ok(())
  }

  fn spawn(&mut self, node_id: &str, input: Value, attempt: u32) {
    let task = NodeTask {
      shared: self.shared.clone(),
      workflow: self.workflow.clone(),
      execution: self.execution.clone(),
      node_id: node_id.to_string(),
      input,
      attempt,
      cancel: self.cancel.clone(),
    };
    let tx = self.tx.clone();
    let node_id = node_id.to_string();
    self.in_flight += 1;

    tokio::spawn(async move {
      // The inner task turns a panic into a JoinError instead of losing
      // the completion.
      let outcome = match tokio::spawn(task.run()).await {
        Ok(outcome) => outcome,
        Err(e) => Ok(Err(NodeError::runtime(format!("node task aborted: {}", e)))),
      };
      let _ = tx.send(Message::Finished { node_id, outcome });
    });
  }

  async fn handle(&mut self, message: Message) -> Result<(), EngineError> {
    match message {
      Message::Finished { node_id, outcome } => {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.complete(&node_id, outcome?).await
      }
      Message::RetryDue { node_id } => {
        if let Some(phase @ Phase::Backoff) = self.phases.get_mut(&node_id) {
          *phase = Phase::RetryDue;
        }
        Ok(())
      }
    }
  }

  async fn complete(&mut self, node_id: &str, result: Result<Value, NodeError>) -> Result<(), EngineError> {
    let workflow = self.workflow.clone();
    let node = workflow.node(node_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let execution_id = self.execution.execution_id.clone();

    let error = match result {
      Ok(output) => {
        self
          .shared
          .store
          .transition_node(
            &execution_id,
            node_id,
            NodeStatus::Running,
            NodeTransition::Succeed {
              output: output.clone(),
            },
          )
          .await?;
        self.phases.insert(node_id.to_string(), Phase::Succeeded(output.clone()));
        self.shared.emitter.node_updated(
          &execution_id,
          node_id,
          NodeStatus::Success,
          format!("node '{}' succeeded", node_id),
          output,
        );
        return Ok(());
      }
      Err(error) => error,
    };

    let state = self
      .shared
      .store
      .transition_node(
        &execution_id,
        node_id,
        NodeStatus::Running,
        NodeTransition::Fail {
          error: error.clone(),
        },
      )
      .await?;
    self.shared.emitter.node_updated(
      &execution_id,
      node_id,
      NodeStatus::Failed,
      format!("node '{}' failed: {}", node_id, error),
      json!({
        "kind": error.kind,
        "message": error.message,
        "retry_count": state.retry_count,
      }),
    );

    let policy = node
      .retry
      .as_ref()
      .unwrap_or(&self.shared.config.default_retry);
    if self.may_dispatch(node_id) && error.is_retryable() && policy.allows_retry(state.retry_count) {
      let delay = policy.backoff(state.retry_count);
      info!(
        execution_id = %execution_id,
        node_id = %node_id,
        retry_count = state.retry_count,
        delay_ms = delay.as_millis() as u64,
        "task_retry_scheduled"
      );
      self.shared.emitter.log(
        &execution_id,
        Some(node_id),
        LogLevel::Warn,
        format!(
          "retrying node '{}' in {}ms ({} of {})",
          node_id,
          delay.as_millis(),
          state.retry_count + 1,
          policy.max_retries
        ),
        json!({ "delay_ms": delay.as_millis() as u64 }),
      );

      self.phases.insert(node_id.to_string(), Phase::Backoff);
      let tx = self.tx.clone();
      let node_id = node_id.to_string();
      tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(Message::RetryDue { node_id });
      });
      return Ok(());
    }

    self.phases.insert(node_id.to_string(), Phase::Failed(error.clone()));
    if !node.continue_on_error && !self.cancel.is_cancelled() {
      self.halt_on(node, &error);
    }
    Ok(())
  }

  /// Stop dispatching everything outside the failed node's descendants.
  fn halt_on(&mut self, failed: &Node, error: &NodeError) {
    if self.halt.is_none() {
      error!(
        execution_id = %self.execution_id(),
        node_id = %failed.node_id,
        error = %error,
        "workflow_halted"
      );
      self.halt = Some(format!("node '{}' failed: {}", failed.node_id, error));
    }
    let descendants = self.workflow.graph().descendants(&failed.node_id);
    self.halt_region.extend(descendants);
  }

  async fn finish(mut self) -> Result<Execution, EngineError> {
    let execution_id = self.execution_id().to_string();
    if self.halt.is_some() && !self.cancel.is_cancelled() {
      // Descendants of the failure that never became ready.
      for node_id in self.order.clone() {
        let pending = matches!(self.phases.get(&node_id), Some(Phase::Pending));
        if pending && self.halt_region.contains(&node_id) {
          self.skip(&node_id, None, "workflow halted".to_string()).await?;
        }
      }
    }
    let unsettled = self.order.iter().find(|id| {
      matches!(
        self.phases.get(*id),
        Some(Phase::Pending | Phase::Running | Phase::Backoff | Phase::RetryDue)
      )
    });

    let (status, error) = if self.timed_out {
      (ExecutionStatus::Failed, Some("execution timed out".to_string()))
    } else if self.cancel.is_cancelled() {
      (ExecutionStatus::Cancelled, None)
    } else if let Some(halt) = self.halt.clone() {
      (ExecutionStatus::Failed, Some(halt))
    } else if let Some(node_id) = unsettled {
      (
        ExecutionStatus::Failed,
        Some(format!("node '{}' never completed", node_id)),
      )
    } else {
      (ExecutionStatus::Success, None)
    };

    let result = self
      .shared
      .store
      .update_execution_status(
        &execution_id,
        &[ExecutionStatus::Running, ExecutionStatus::Paused],
        status,
        error.clone(),
      )
      .await;

    match result {
      Ok(execution) => {
        let message = match status {
          ExecutionStatus::Success => {
            info!(execution_id = %execution_id, "workflow_completed");
            "execution succeeded".to_string()
          }
          ExecutionStatus::Cancelled => {
            warn!(execution_id = %execution_id, "workflow_cancelled");
            "execution cancelled".to_string()
          }
          _ => {
            let message = error.unwrap_or_else(|| "execution failed".to_string());
            error!(execution_id = %execution_id, error = %message, "workflow_failed");
            message
          }
        };
        self
          .shared
          .emitter
          .execution_updated(&execution_id, status, message);
        Ok(execution)
      }
      // Already finalized by a cancel request.
      Err(StoreError::Conflict { .. }) => Ok(self.shared.store.get_execution(&execution_id).await?),
      Err(e) => Err(e.into()),
    }
  }
}

/// The upstream value a continue-on-error node sees for a failed upstream.
fn error_input(node_id: &str, error: &NodeError) -> Value {
  json!({
    "error": {
      "node_id": node_id,
      "kind": error.kind,
      "message": error.message,
    }
  })
}

/// One attempt of one node, run on its own task.
struct NodeTask {
  shared: Arc<Shared>,
  workflow: Arc<Workflow>,
  execution: Execution,
  node_id: String,
  input: Value,
  attempt: u32,
  cancel: CancellationToken,
}

impl NodeTask {
  async fn run(self) -> Outcome {
    let workflow = self.workflow.clone();
    let Some(node) = workflow.get_node(&self.node_id) else {
      return Ok(Err(NodeError::configuration(format!(
        "node '{}' is not part of the workflow",
        self.node_id
      ))));
    };

    // The scheduler records an upstream success before dispatching its
    // downstream, so the context holds every output this node can see.
    let context = self.shared.store.context(&self.execution.execution_id).await?;
    let scope = Scope {
      nodes: context.outputs,
      vars: context.variables,
      execution: ExecutionMeta {
        id: self.execution.execution_id.clone(),
      },
      workflow: WorkflowMeta {
        id: workflow.workflow_id.clone(),
        version: workflow.version,
      },
      now: Utc::now().to_rfc3339(),
      trigger: self.execution.trigger_payload.clone(),
      input: self.input.clone(),
    };

    let resolved = match self.shared.resolver.resolve(&node.node_id, &node.config, &scope) {
      Ok(resolved) => resolved,
      Err(e) => {
        self.shared.emitter.log(
          &self.execution.execution_id,
          Some(&node.node_id),
          LogLevel::Error,
          e.to_string(),
          json!({ "path": e.path() }),
        );
        return Ok(Err(NodeError::validation(e.to_string())));
      }
    };

    let timeout = node
      .timeout_ms
      .map(Duration::from_millis)
      .unwrap_or_else(|| self.shared.config.default_node_timeout());

    let invocation = Invocation {
      execution_id: self.execution.execution_id,
      workflow_id: workflow.workflow_id.clone(),
      node_id: self.node_id,
      node_type: node.node_type.clone(),
      attempt: self.attempt,
      input: resolved,
      upstream: self.input,
      timeout,
      credentials: node.credentials.clone(),
      user_id: self.execution.user_id,
    };
    Ok(self.shared.invoker.invoke(invocation, self.cancel).await)
  }
}
