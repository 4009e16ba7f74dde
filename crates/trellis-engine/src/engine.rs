//! Workflow execution engine.
//!
//! The [`Engine`] starts executions, runs one scheduler task per execution
//! and exposes status, logs, live events and control (cancel, pause,
//! resume) by execution id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use trellis_events::{Emitter, ExecutionNotifier, NoopNotifier, Subscription};
use trellis_expression::ExpressionResolver;
use trellis_invoker::{CredentialResolver, NodeInvoker, NodeRegistry, StaticCredentials};
use trellis_store::{
  Execution, ExecutionLogEntry, ExecutionStatus, ExecutionStore, MemoryStore, NodeState, StoreError,
};

use crate::scheduler::Scheduler;
use crate::{EngineConfig, EngineError, InMemoryWorkflows, TriggerFiring, WorkflowSource};

/// Control handles of a running execution.
struct RunHandle {
  cancel: CancellationToken,
  paused: watch::Sender<bool>,
  done: watch::Receiver<bool>,
}

/// State shared by the engine and its scheduler tasks.
pub(crate) struct Shared {
  pub(crate) config: EngineConfig,
  pub(crate) store: Arc<dyn ExecutionStore>,
  pub(crate) workflows: Arc<dyn WorkflowSource>,
  pub(crate) emitter: Emitter,
  pub(crate) invoker: NodeInvoker,
  pub(crate) resolver: ExpressionResolver,
  runs: Mutex<HashMap<String, RunHandle>>,
}

impl Shared {
  fn runs(&self) -> MutexGuard<'_, HashMap<String, RunHandle>> {
    self.runs.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
  registry: Arc<dyn NodeRegistry>,
  config: EngineConfig,
  store: Option<Arc<dyn ExecutionStore>>,
  workflows: Option<Arc<dyn WorkflowSource>>,
  credentials: Option<Arc<dyn CredentialResolver>>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl EngineBuilder {
  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// Defaults to a [`MemoryStore`].
  pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Defaults to an empty [`InMemoryWorkflows`].
  pub fn workflows(mut self, workflows: Arc<dyn WorkflowSource>) -> Self {
    self.workflows = Some(workflows);
    self
  }

  /// Defaults to no credentials at all.
  pub fn credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
    self.credentials = Some(credentials);
    self
  }

  /// Receive every event of every execution.
  pub fn notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Build the engine. Must be called within a Tokio runtime.
  pub fn build(self) -> Engine {
    let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
    let workflows = self
      .workflows
      .unwrap_or_else(|| Arc::new(InMemoryWorkflows::new()));
    let credentials = self
      .credentials
      .unwrap_or_else(|| Arc::new(StaticCredentials::new()));

    let emitter = Emitter::with_notifier(store.clone(), self.config.event_buffer, self.notifier);
    let invoker = NodeInvoker::new(self.registry, credentials, emitter.clone());

    Engine {
      shared: Arc::new(Shared {
        config: self.config,
        store,
        workflows,
        emitter,
        invoker,
        resolver: ExpressionResolver::new(),
        runs: Mutex::new(HashMap::new()),
      }),
    }
  }
}

/// The workflow execution engine.
///
/// Cloning is cheap; clones drive the same executions.
#[derive(Clone)]
pub struct Engine {
  pub(crate) shared: Arc<Shared>,
}

impl Engine {
  /// Start building an engine around a node registry.
  pub fn builder(registry: Arc<dyn NodeRegistry>) -> EngineBuilder {
    EngineBuilder {
      registry,
      config: EngineConfig::default(),
      store: None,
      workflows: None,
      credentials: None,
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.shared.config
  }

  /// Start a manual execution of a workflow version (latest if `None`).
  pub async fn start_execution(
    &self,
    workflow_id: &str,
    version: Option<u32>,
    payload: serde_json::Value,
  ) -> Result<String, EngineError> {
    let mut firing = TriggerFiring::manual(workflow_id, payload);
    firing.version = version;
    self.fire(firing).await
  }

  /// Start an execution for a trigger firing and return its id.
  ///
  /// The execution record exists when this returns; the run itself
  /// proceeds on its own task.
  #[instrument(
    name = "engine_fire",
    skip(self, firing),
    fields(workflow_id = %firing.workflow_id, trigger = %firing.kind)
  )]
  pub async fn fire(&self, firing: TriggerFiring) -> Result<String, EngineError> {
    let workflow = self
      .shared
      .workflows
      .load(&firing.workflow_id, firing.version)
      .await?;

    let execution_id = uuid::Uuid::new_v4().to_string();
    let mut execution = Execution::new(
      &execution_id,
      &workflow.workflow_id,
      workflow.version,
      firing.kind,
      firing.payload,
    );
    execution.variables = workflow.variables.clone();
    execution.user_id = firing.user_id;

    let node_ids: Vec<String> = workflow.nodes.iter().map(|n| n.node_id.clone()).collect();
    self.shared.store.create_execution(&execution, &node_ids).await?;
    self.shared.emitter.open(&execution_id);

    let cancel = CancellationToken::new();
    let (paused_tx, paused_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);
    self.shared.runs().insert(
      execution_id.clone(),
      RunHandle {
        cancel: cancel.clone(),
        paused: paused_tx,
        done: done_rx,
      },
    );

    info!(execution_id = %execution_id, version = workflow.version, "execution_created");

    let scheduler = Scheduler::new(self.shared.clone(), workflow, execution, cancel, paused_rx);
    let shared = self.shared.clone();
    let id = execution_id.clone();
    tokio::spawn(async move {
      if let Err(e) = scheduler.run().await {
        error!(execution_id = %id, error = %e, "workflow_aborted");
        abort_execution(&shared, &id, &e).await;
      }
      shared.emitter.flush().await;
      shared.emitter.retire(&id);
      shared.runs().remove(&id);
      let _ = done_tx.send(true);
    });

    Ok(execution_id)
  }

  pub async fn get_execution_status(&self, execution_id: &str) -> Result<Execution, EngineError> {
    self
      .shared
      .store
      .get_execution(execution_id)
      .await
      .map_err(EngineError::lookup(execution_id))
  }

  /// Executions of a workflow, newest first.
  pub async fn list_executions(&self, workflow_id: &str) -> Result<Vec<Execution>, EngineError> {
    Ok(self.shared.store.list_executions(workflow_id).await?)
  }

  /// Persisted log entries after the `since` sequence number.
  ///
  /// Everything emitted before the call is included.
  pub async fn get_execution_logs(
    &self,
    execution_id: &str,
    since: Option<u64>,
  ) -> Result<Vec<ExecutionLogEntry>, EngineError> {
    self.shared.emitter.flush().await;
    self
      .shared
      .store
      .list_logs(execution_id, since)
      .await
      .map_err(EngineError::lookup(execution_id))
  }

  pub async fn get_node_states(&self, execution_id: &str) -> Result<Vec<NodeState>, EngineError> {
    self
      .shared
      .store
      .list_node_states(execution_id)
      .await
      .map_err(EngineError::lookup(execution_id))
  }

  /// Subscribe to an execution's live events.
  ///
  /// Events emitted before the call are only available from
  /// [`Engine::get_execution_logs`]. The stream of a finished execution is
  /// already closed.
  pub async fn subscribe(&self, execution_id: &str) -> Result<Subscription, EngineError> {
    self.get_execution_status(execution_id).await?;
    Ok(self.shared.emitter.subscribe(execution_id))
  }

  /// Cancel an execution.
  ///
  /// No node starts after this returns. Nodes already running are asked to
  /// stop and their results are still recorded.
  #[instrument(name = "engine_cancel", skip(self))]
  pub async fn cancel_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
    if let Some(handle) = self.shared.runs().get(execution_id) {
      handle.cancel.cancel();
    }

    let result = self
      .shared
      .store
      .update_execution_status(
        execution_id,
        &[ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Paused],
        ExecutionStatus::Cancelled,
        None,
      )
      .await;

    match result {
      Ok(execution) => {
        info!(execution_id = %execution_id, "workflow_cancelled");
        self
          .shared
          .emitter
          .execution_updated(execution_id, ExecutionStatus::Cancelled, "execution cancelled");
        Ok(execution)
      }
      // The scheduler may have recorded the cancellation first.
      Err(StoreError::Conflict { .. }) => {
        let execution = self.get_execution_status(execution_id).await?;
        if execution.status == ExecutionStatus::Cancelled {
          Ok(execution)
        } else {
          Err(EngineError::InvalidState {
            execution_id: execution_id.to_string(),
            status: execution.status,
            action: "cancelled",
          })
        }
      }
      Err(e) => Err(EngineError::lookup(execution_id)(e)),
    }
  }

  /// Stop dispatching new nodes until resumed. Running nodes continue.
  #[instrument(name = "engine_pause", skip(self))]
  pub async fn pause_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
    let execution = self
      .set_status(execution_id, ExecutionStatus::Running, ExecutionStatus::Paused, "paused")
      .await?;
    if let Some(handle) = self.shared.runs().get(execution_id) {
      handle.paused.send_replace(true);
    }
    info!(execution_id = %execution_id, "workflow_paused");
    Ok(execution)
  }

  #[instrument(name = "engine_resume", skip(self))]
  pub async fn resume_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
    let execution = self
      .set_status(execution_id, ExecutionStatus::Paused, ExecutionStatus::Running, "resumed")
      .await?;
    if let Some(handle) = self.shared.runs().get(execution_id) {
      handle.paused.send_replace(false);
    }
    info!(execution_id = %execution_id, "workflow_resumed");
    Ok(execution)
  }

  /// Wait until the execution's scheduler has finished and its logs are
  /// persisted, then return the final record.
  pub async fn wait_for_completion(&self, execution_id: &str) -> Result<Execution, EngineError> {
    let done = self
      .shared
      .runs()
      .get(execution_id)
      .map(|handle| handle.done.clone());
    if let Some(mut done) = done {
      let _ = done.wait_for(|finished| *finished).await;
    }
    self.get_execution_status(execution_id).await
  }

  /// Executions whose live event stream is still open.
  pub fn open_event_streams(&self) -> usize {
    self.shared.emitter.open_streams()
  }

  async fn set_status(
    &self,
    execution_id: &str,
    from: ExecutionStatus,
    to: ExecutionStatus,
    action: &'static str,
  ) -> Result<Execution, EngineError> {
    // `action` reads as a past participle: "paused", "resumed".
    match self
      .shared
      .store
      .update_execution_status(execution_id, &[from], to, None)
      .await
    {
      Ok(execution) => {
        self
          .shared
          .emitter
          .execution_updated(execution_id, to, format!("execution {}", action));
        Ok(execution)
      }
      Err(StoreError::Conflict { .. }) => {
        let execution = self.get_execution_status(execution_id).await?;
        Err(EngineError::InvalidState {
          execution_id: execution_id.to_string(),
          status: execution.status,
          action,
        })
      }
      Err(e) => Err(EngineError::lookup(execution_id)(e)),
    }
  }
}

/// Best-effort terminal record for a run whose scheduler hit a store error.
async fn abort_execution(shared: &Shared, execution_id: &str, cause: &EngineError) {
  let message = format!("engine error: {}", cause);
  let result = shared
    .store
    .update_execution_status(
      execution_id,
      &[ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Paused],
      ExecutionStatus::Failed,
      Some(message.clone()),
    )
    .await;
  if result.is_ok() {
    shared
      .emitter
      .execution_updated(execution_id, ExecutionStatus::Failed, message);
  }
}
