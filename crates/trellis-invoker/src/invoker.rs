use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use trellis_events::Emitter;
use trellis_store::NodeError;

use crate::{CredentialResolver, ExecutionMode, NodeContext, NodeLogger, NodeRegistry};

/// One call of one node.
#[derive(Debug, Clone)]
pub struct Invocation {
  pub execution_id: String,
  pub workflow_id: String,
  pub node_id: String,
  pub node_type: String,
  pub attempt: u32,
  /// The node's configuration with expressions resolved.
  pub input: serde_json::Value,
  pub upstream: serde_json::Value,
  pub timeout: Duration,
  /// Slot name to credential id.
  pub credentials: HashMap<String, String>,
  pub user_id: Option<String>,
}

/// Runs node implementations under their deadline.
#[derive(Clone)]
pub struct NodeInvoker {
  registry: Arc<dyn NodeRegistry>,
  credentials: Arc<dyn CredentialResolver>,
  emitter: Emitter,
}

impl NodeInvoker {
  pub fn new(registry: Arc<dyn NodeRegistry>, credentials: Arc<dyn CredentialResolver>, emitter: Emitter) -> Self {
    Self {
      registry,
      credentials,
      emitter,
    }
  }

  /// Invoke a node and return its output.
  ///
  /// Expiry of the deadline is reported as a timeout whether or not the
  /// implementation stopped. `cancel` is handed to the implementation; the
  /// invoker does not interrupt it.
  #[instrument(
    name = "node_invoke",
    skip(self, invocation, cancel),
    fields(
      execution_id = %invocation.execution_id,
      node_id = %invocation.node_id,
      node_type = %invocation.node_type,
      attempt = invocation.attempt,
    )
  )]
  pub async fn invoke(&self, invocation: Invocation, cancel: CancellationToken) -> Result<serde_json::Value, NodeError> {
    info!("task_started");

    let result = self.invoke_inner(invocation, cancel).await;

    match &result {
      Ok(output) => info!(output = %output, "task_completed"),
      Err(e) => error!(error = %e, kind = %e.kind, "task_failed"),
    }

    result
  }

  async fn invoke_inner(
    &self,
    invocation: Invocation,
    cancel: CancellationToken,
  ) -> Result<serde_json::Value, NodeError> {
    let implementation = self.registry.resolve(&invocation.node_type).ok_or_else(|| {
      NodeError::configuration(format!(
        "no implementation registered for node type '{}'",
        invocation.node_type
      ))
    })?;

    if cancel.is_cancelled() {
      return Err(NodeError::cancelled());
    }

    let mode = implementation.mode();
    let (items, mut collected) = match mode {
      ExecutionMode::Stream => {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
      }
      _ => (None, None),
    };

    let ctx = NodeContext {
      logger: NodeLogger::new(self.emitter.clone(), &invocation.execution_id, &invocation.node_id),
      execution_id: invocation.execution_id,
      workflow_id: invocation.workflow_id,
      node_id: invocation.node_id,
      attempt: invocation.attempt,
      upstream: invocation.upstream,
      user_id: invocation.user_id,
      credential_slots: invocation.credentials,
      credentials: self.credentials.clone(),
      cancel,
      items,
    };
    let timeout = invocation.timeout;
    let input = invocation.input;
    let timed_out = || NodeError::timeout(format!("node exceeded its {}ms deadline", timeout.as_millis()));

    match mode {
      ExecutionMode::Sync => tokio::time::timeout(timeout, implementation.execute(input, &ctx))
        .await
        .map_err(|_| timed_out())?,
      ExecutionMode::Async | ExecutionMode::Stream => {
        // A timed-out task is detached, not aborted.
        let handle = tokio::spawn(async move { implementation.execute(input, &ctx).await });
        let result = tokio::time::timeout(timeout, handle)
          .await
          .map_err(|_| timed_out())?
          .map_err(join_error)??;

        match collected.as_mut() {
          Some(rx) => {
            let mut items = Vec::new();
            while let Ok(item) = rx.try_recv() {
              items.push(item);
            }
            Ok(serde_json::json!({ "items": items, "result": result }))
          }
          None => Ok(result),
        }
      }
    }
  }
}

fn join_error(e: JoinError) -> NodeError {
  if e.is_panic() {
    NodeError::runtime("node implementation panicked")
  } else {
    NodeError::cancelled()
  }
}
