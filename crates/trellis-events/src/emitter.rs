use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error};
use trellis_store::{ExecutionLogEntry, ExecutionStatus, ExecutionStore, LogLevel, NodeStatus};

use crate::{EventKind, EventStatus, ExecutionEvent, ExecutionNotifier, NoopNotifier, Subscription};

/// Upper bound on entries written per store call.
const PERSIST_BATCH: usize = 128;

enum Command {
  Persist(ExecutionLogEntry),
  Flush(oneshot::Sender<()>),
}

struct Stream {
  sender: broadcast::Sender<ExecutionEvent>,
  next_sequence: u64,
  last_timestamp: DateTime<Utc>,
}

struct Inner {
  streams: Mutex<HashMap<String, Stream>>,
  persist: mpsc::UnboundedSender<Command>,
  notifier: Arc<dyn ExecutionNotifier>,
  capacity: usize,
}

/// Sequences, broadcasts and persists execution events.
///
/// Emission never waits: the broadcast is lossy per subscriber and
/// persistence runs on a background task fed by an unbounded queue. Cloning
/// is cheap and shares all state.
#[derive(Clone)]
pub struct Emitter {
  inner: Arc<Inner>,
}

impl Emitter {
  /// Create an emitter persisting into `store`.
  ///
  /// Spawns the persistence task, so it must be called within a Tokio
  /// runtime. `capacity` bounds each subscriber's live buffer.
  pub fn new(store: Arc<dyn ExecutionStore>, capacity: usize) -> Self {
    Self::with_notifier(store, capacity, Arc::new(NoopNotifier))
  }

  /// Like [`Emitter::new`], also handing every event to `notifier`.
  pub fn with_notifier(
    store: Arc<dyn ExecutionStore>,
    capacity: usize,
    notifier: Arc<dyn ExecutionNotifier>,
  ) -> Self {
    let (persist, receiver) = mpsc::unbounded_channel();
    tokio::spawn(persist_loop(receiver, store));

    Self {
      inner: Arc::new(Inner {
        streams: Mutex::new(HashMap::new()),
        persist,
        notifier,
        capacity: capacity.max(1),
      }),
    }
  }

  /// Start the event stream of a new execution.
  pub fn open(&self, execution_id: &str) {
    let mut streams = self.lock();
    streams
      .entry(execution_id.to_string())
      .or_insert_with(|| Stream {
        sender: broadcast::channel(self.inner.capacity).0,
        next_sequence: 1,
        last_timestamp: DateTime::<Utc>::MIN_UTC,
      });
  }

  /// Subscribe to an execution's live events.
  ///
  /// Only events emitted after this call are delivered. The subscription of
  /// a retired or unknown execution is already closed.
  pub fn subscribe(&self, execution_id: &str) -> Subscription {
    let streams = self.lock();
    let receiver = match streams.get(execution_id) {
      Some(stream) => stream.sender.subscribe(),
      None => broadcast::channel(1).1,
    };
    Subscription::new(execution_id.to_string(), receiver)
  }

  /// Close the live feed of a finished execution and forget its stream.
  ///
  /// Subscribers receive what is buffered, then [`crate::RecvError::Closed`].
  /// Events emitted afterwards are dropped.
  pub fn retire(&self, execution_id: &str) {
    if self.lock().remove(execution_id).is_some() {
      debug!(execution_id = %execution_id, "event_stream_retired");
    }
  }

  /// Number of executions with an open event stream.
  pub fn open_streams(&self) -> usize {
    self.lock().len()
  }

  /// Wait until every event emitted so far has been handed to the store.
  pub async fn flush(&self) {
    let (done, wait) = oneshot::channel();
    if self.inner.persist.send(Command::Flush(done)).is_ok() {
      let _ = wait.await;
    }
  }

  /// Report a node status change.
  pub fn node_updated(
    &self,
    execution_id: &str,
    node_id: &str,
    status: NodeStatus,
    message: impl Into<String>,
    payload: serde_json::Value,
  ) -> Option<ExecutionEvent> {
    let level = match status {
      NodeStatus::Failed => LogLevel::Error,
      NodeStatus::Skipped => LogLevel::Warn,
      _ => LogLevel::Info,
    };
    self.emit(
      execution_id,
      EventKind::NodeUpdated,
      Some(node_id),
      Some(EventStatus::Node(status)),
      level,
      message.into(),
      payload,
    )
  }

  /// Report a log line, optionally attributed to a node.
  pub fn log(
    &self,
    execution_id: &str,
    node_id: Option<&str>,
    level: LogLevel,
    message: impl Into<String>,
    metadata: serde_json::Value,
  ) -> Option<ExecutionEvent> {
    self.emit(
      execution_id,
      EventKind::LogNew,
      node_id,
      None,
      level,
      message.into(),
      metadata,
    )
  }

  /// Report an execution status change.
  ///
  /// Terminal statuses produce `EXECUTION_COMPLETED`, others
  /// `EXECUTION_UPDATED`.
  pub fn execution_updated(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    message: impl Into<String>,
  ) -> Option<ExecutionEvent> {
    let (kind, level) = match status {
      ExecutionStatus::Failed => (EventKind::ExecutionCompleted, LogLevel::Error),
      s if s.is_terminal() => (EventKind::ExecutionCompleted, LogLevel::Info),
      _ => (EventKind::ExecutionUpdated, LogLevel::Info),
    };
    self.emit(
      execution_id,
      kind,
      None,
      Some(EventStatus::Execution(status)),
      level,
      message.into(),
      serde_json::Value::Null,
    )
  }

  #[allow(clippy::too_many_arguments)]
  fn emit(
    &self,
    execution_id: &str,
    kind: EventKind,
    node_id: Option<&str>,
    status: Option<EventStatus>,
    level: LogLevel,
    message: String,
    payload: serde_json::Value,
  ) -> Option<ExecutionEvent> {
    let event = {
      let mut streams = self.lock();
      let Some(stream) = streams.get_mut(execution_id) else {
        debug!(execution_id = %execution_id, kind = ?kind, "event_dropped");
        return None;
      };

      let timestamp = Utc::now().max(stream.last_timestamp);
      stream.last_timestamp = timestamp;
      let sequence = stream.next_sequence;
      stream.next_sequence += 1;

      let event = ExecutionEvent {
        execution_id: execution_id.to_string(),
        sequence,
        kind,
        node_id: node_id.map(str::to_string),
        status,
        level,
        message,
        payload,
        timestamp,
      };

      // Queue under the lock so persisted order matches sequence order.
      if self
        .inner
        .persist
        .send(Command::Persist(event.to_log_entry()))
        .is_err()
      {
        error!(execution_id = %execution_id, sequence, "log_persistence_stopped");
      }
      // No receivers is fine
      let _ = stream.sender.send(event.clone());
      event
    };

    self.inner.notifier.notify(&event);
    Some(event)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stream>> {
    self
      .inner
      .streams
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

async fn persist_loop(mut receiver: mpsc::UnboundedReceiver<Command>, store: Arc<dyn ExecutionStore>) {
  let mut batch = Vec::with_capacity(PERSIST_BATCH);
  let mut waiters = Vec::new();

  while let Some(command) = receiver.recv().await {
    let mut next = Some(command);
    while let Some(command) = next.take() {
      match command {
        Command::Persist(entry) => batch.push(entry),
        Command::Flush(done) => waiters.push(done),
      }
      if batch.len() < PERSIST_BATCH {
        next = receiver.try_recv().ok();
      }
    }

    if !batch.is_empty() {
      if let Err(e) = store.append_logs(&batch).await {
        error!(error = %e, entries = batch.len(), "log_persist_failed");
      } else {
        debug!(entries = batch.len(), "logs_persisted");
      }
      batch.clear();
    }
    for done in waiters.drain(..) {
      let _ = done.send(());
    }
  }
}
