//! Trigger adapter with channel-based firing.
//!
//! The [`TriggerRunner`] owns an mpsc channel of [`TriggerFiring`]s and
//! starts one execution per firing on the [`Engine`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trellis_config::TriggerKind;

use crate::{Engine, EngineError};

/// A request to run a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFiring {
  pub workflow_id: String,
  /// `None` runs the latest version.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<u32>,
  #[serde(default)]
  pub kind: TriggerKind,
  #[serde(default)]
  pub payload: serde_json::Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
}

impl TriggerFiring {
  pub fn manual(workflow_id: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      version: None,
      kind: TriggerKind::Manual,
      payload,
      user_id: None,
    }
  }

  pub fn with_kind(mut self, kind: TriggerKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn with_version(mut self, version: u32) -> Self {
    self.version = Some(version);
    self
  }

  pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
    self.user_id = Some(user_id.into());
    self
  }
}

/// Starts executions for firings received over a channel.
///
/// # Usage
///
/// ```ignore
/// let runner = TriggerRunner::new(engine);
///
/// // Hand senders to webhooks, schedulers, UI handlers
/// let sender = runner.sender();
///
/// let cancel = CancellationToken::new();
/// runner.start(cancel).await;
/// ```
pub struct TriggerRunner {
  sender: mpsc::Sender<TriggerFiring>,
  receiver: mpsc::Receiver<TriggerFiring>,
  engine: Engine,
}

impl TriggerRunner {
  pub fn new(engine: Engine) -> Self {
    Self::with_buffer_size(engine, 100)
  }

  pub fn with_buffer_size(engine: Engine, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size);
    Self {
      sender,
      receiver,
      engine,
    }
  }

  pub fn sender(&self) -> mpsc::Sender<TriggerFiring> {
    self.sender.clone()
  }

  /// Queue a firing. Waits while the channel is full.
  pub async fn fire(&self, firing: TriggerFiring) -> Result<(), mpsc::error::SendError<TriggerFiring>> {
    self.sender.send(firing).await
  }

  /// Run until cancelled or every sender is gone.
  ///
  /// Executions are started, not awaited; they run concurrently. Returns
  /// how many were started.
  pub async fn start(mut self, cancel: CancellationToken) -> usize {
    info!("starting trigger runner");
    // Only external senders should keep the loop alive.
    drop(self.sender);
    let mut started = 0usize;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(started, "trigger runner cancelled");
          break;
        }
        firing = self.receiver.recv() => {
          let Some(firing) = firing else {
            info!(started, "trigger runner channel closed");
            break;
          };
          match self.engine.fire(firing.clone()).await {
            Ok(execution_id) => {
              info!(
                workflow_id = %firing.workflow_id,
                trigger = %firing.kind,
                execution_id = %execution_id,
                "triggering workflow execution"
              );
              started += 1;
            }
            Err(e) => log_rejected(&firing, &e),
          }
        }
      }
    }

    started
  }
}

fn log_rejected(firing: &TriggerFiring, e: &EngineError) {
  error!(
    workflow_id = %firing.workflow_id,
    trigger = %firing.kind,
    error = %e,
    "trigger firing rejected"
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;
  use std::time::Duration;
  use trellis_invoker::StaticRegistry;

  fn create_test_engine() -> Engine {
    Engine::builder(Arc::new(StaticRegistry::new())).build()
  }

  #[tokio::test]
  async fn test_sender_cloning() {
    let runner = TriggerRunner::new(create_test_engine());

    let sender1 = runner.sender();
    let sender2 = runner.sender();

    assert!(!sender1.is_closed());
    assert!(!sender2.is_closed());
  }

  #[tokio::test]
  async fn test_fire_sends_to_channel() {
    let mut runner = TriggerRunner::new(create_test_engine());

    runner
      .fire(TriggerFiring::manual("wf", json!({ "test": "data" })))
      .await
      .unwrap();

    let received = runner.receiver.recv().await.unwrap();
    assert_eq!(received.workflow_id, "wf");
    assert_eq!(received.payload["test"], "data");
  }

  #[tokio::test]
  async fn test_cancellation() {
    let runner = TriggerRunner::new(create_test_engine());
    // Keep a sender alive so only the token can stop the loop.
    let _sender = runner.sender();

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let handle = tokio::spawn(async move { runner.start(cancel_clone).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let started = handle.await.unwrap();
    assert_eq!(started, 0);
  }

  #[test]
  fn test_firing_defaults_from_json() {
    let firing: TriggerFiring =
      serde_json::from_value(json!({ "workflow_id": "wf", "kind": "webhook" })).unwrap();
    assert_eq!(firing.kind, TriggerKind::Webhook);
    assert_eq!(firing.payload, serde_json::Value::Null);
    assert!(firing.version.is_none());
  }

  #[test]
  fn test_builder_methods() {
    let firing = TriggerFiring::manual("wf", json!({ "x": 1 }))
      .with_kind(TriggerKind::Schedule)
      .with_version(4)
      .with_user("alice");
    assert_eq!(firing.version, Some(4));
    assert_eq!(firing.user_id.as_deref(), Some("alice"));
    assert_eq!(firing.kind, TriggerKind::Schedule);
  }
}
