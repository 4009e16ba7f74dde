use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_events::Emitter;
use trellis_store::{LogLevel, NodeError};

use crate::{Credential, CredentialError, CredentialResolver};

/// Writes a node's log lines into its execution's event stream.
#[derive(Clone)]
pub struct NodeLogger {
  emitter: Emitter,
  execution_id: String,
  node_id: String,
}

impl NodeLogger {
  pub fn new(emitter: Emitter, execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
    Self {
      emitter,
      execution_id: execution_id.into(),
      node_id: node_id.into(),
    }
  }

  pub fn log(&self, level: LogLevel, message: impl Into<String>, metadata: serde_json::Value) {
    self
      .emitter
      .log(&self.execution_id, Some(&self.node_id), level, message, metadata);
  }

  pub fn debug(&self, message: impl Into<String>) {
    self.log(LogLevel::Debug, message, serde_json::Value::Null);
  }

  pub fn info(&self, message: impl Into<String>) {
    self.log(LogLevel::Info, message, serde_json::Value::Null);
  }

  pub fn warn(&self, message: impl Into<String>) {
    self.log(LogLevel::Warn, message, serde_json::Value::Null);
  }

  pub fn error(&self, message: impl Into<String>) {
    self.log(LogLevel::Error, message, serde_json::Value::Null);
  }
}

/// Everything a node implementation may touch while it runs.
#[derive(Clone)]
pub struct NodeContext {
  pub execution_id: String,
  pub workflow_id: String,
  pub node_id: String,
  /// 0 for the first attempt, incremented per retry.
  pub attempt: u32,
  /// Upstream data: the trigger payload for entry nodes, the single
  /// upstream output, or an object keyed by upstream node id.
  pub upstream: serde_json::Value,
  pub(crate) user_id: Option<String>,
  pub(crate) credential_slots: HashMap<String, String>,
  pub(crate) credentials: Arc<dyn CredentialResolver>,
  pub(crate) logger: NodeLogger,
  pub(crate) cancel: CancellationToken,
  pub(crate) items: Option<mpsc::UnboundedSender<serde_json::Value>>,
}

impl NodeContext {
  /// Resolve the credential bound to `slot` in the node definition.
  pub async fn credential(&self, slot: &str) -> Result<Credential, CredentialError> {
    let credential_id = self
      .credential_slots
      .get(slot)
      .ok_or_else(|| CredentialError::UnboundSlot {
        slot: slot.to_string(),
      })?;
    self
      .credentials
      .resolve(credential_id, self.user_id.as_deref())
      .await
  }

  pub fn logger(&self) -> &NodeLogger {
    &self.logger
  }

  /// Fires when the execution is cancelled. Long-running nodes should
  /// watch it and stop early.
  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Push one item of a streaming node's output.
  pub fn emit(&self, item: serde_json::Value) -> Result<(), NodeError> {
    let items = self.items.as_ref().ok_or_else(|| {
      NodeError::configuration(format!(
        "node '{}' emitted an item but does not run in stream mode",
        self.node_id
      ))
      .fatal()
    })?;
    items
      .send(item)
      .map_err(|_| NodeError::runtime("stream output is no longer collected").fatal())
  }
}
