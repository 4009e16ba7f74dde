use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_config::TriggerKind;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Success,
  Failed,
  Cancelled,
  Paused,
}

impl ExecutionStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
    )
  }
}

/// Status of one node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NodeStatus {
  Pending,
  Running,
  Success,
  Failed,
  Skipped,
}

impl NodeStatus {
  /// Whether the state machine allows moving from `self` to `to`.
  ///
  /// `Failed -> Running` is the retry edge.
  pub fn can_transition(&self, to: NodeStatus) -> bool {
    matches!(
      (self, to),
      (NodeStatus::Pending, NodeStatus::Running)
        | (NodeStatus::Pending, NodeStatus::Skipped)
        | (NodeStatus::Running, NodeStatus::Success)
        | (NodeStatus::Running, NodeStatus::Failed)
        | (NodeStatus::Failed, NodeStatus::Running)
    )
  }
}

/// Failure taxonomy for node invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Unknown node type, bad config, credential problems.
  Configuration,
  /// Expression resolution failed.
  Validation,
  Timeout,
  /// The node implementation reported an error.
  Runtime,
  Cancelled,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Configuration => "configuration",
      ErrorKind::Validation => "validation",
      ErrorKind::Timeout => "timeout",
      ErrorKind::Runtime => "runtime",
      ErrorKind::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A typed node failure as recorded on a [`NodeState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct NodeError {
  pub kind: ErrorKind,
  pub message: String,
  /// Set by implementations that know a retry cannot help.
  #[serde(default)]
  pub fatal: bool,
}

impl NodeError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      fatal: false,
    }
  }

  pub fn configuration(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Configuration, message)
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Validation, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message)
  }

  pub fn runtime(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Runtime, message)
  }

  pub fn cancelled() -> Self {
    Self::new(ErrorKind::Cancelled, "invocation cancelled")
  }

  /// Mark a runtime error as not worth retrying.
  pub fn fatal(mut self) -> Self {
    self.fatal = true;
    self
  }

  /// Whether a retry policy may retry this failure.
  pub fn is_retryable(&self) -> bool {
    match self.kind {
      ErrorKind::Timeout => true,
      ErrorKind::Runtime => !self.fatal,
      ErrorKind::Configuration | ErrorKind::Validation | ErrorKind::Cancelled => false,
    }
  }
}

/// One run of a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
  pub execution_id: String,
  pub workflow_id: String,
  pub workflow_version: u32,
  pub status: ExecutionStatus,
  pub trigger_kind: TriggerKind,
  pub trigger_payload: serde_json::Value,
  pub variables: serde_json::Map<String, serde_json::Value>,
  /// User on whose behalf credentials are resolved.
  pub user_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub error: Option<String>,
}

impl Execution {
  /// A fresh pending execution.
  pub fn new(
    execution_id: impl Into<String>,
    workflow_id: impl Into<String>,
    workflow_version: u32,
    trigger_kind: TriggerKind,
    trigger_payload: serde_json::Value,
  ) -> Self {
    Self {
      execution_id: execution_id.into(),
      workflow_id: workflow_id.into(),
      workflow_version,
      status: ExecutionStatus::Pending,
      trigger_kind,
      trigger_payload,
      variables: serde_json::Map::new(),
      user_id: None,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
      error: None,
    }
  }

  /// Wall time between start and completion, once both are known.
  pub fn duration(&self) -> Option<chrono::Duration> {
    Some(self.completed_at? - self.started_at?)
  }

  /// Apply a status change, stamping start and completion times.
  pub(crate) fn apply_status(&mut self, status: ExecutionStatus, error: Option<String>, now: DateTime<Utc>) {
    if status == ExecutionStatus::Running && self.started_at.is_none() {
      self.started_at = Some(now);
    }
    if status.is_terminal() {
      self.completed_at = Some(now);
      // A cancel or failure may arrive before the run ever started.
      self.started_at.get_or_insert(now);
    }
    if error.is_some() {
      self.error = error;
    }
    self.status = status;
  }
}

/// One node's execution within one [`Execution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
  pub execution_id: String,
  pub node_id: String,
  pub status: NodeStatus,
  /// Upstream input of the latest attempt.
  pub input: Option<serde_json::Value>,
  pub output: Option<serde_json::Value>,
  pub error: Option<NodeError>,
  pub retry_count: u32,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl NodeState {
  pub fn pending(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      node_id: node_id.into(),
      status: NodeStatus::Pending,
      input: None,
      output: None,
      error: None,
      retry_count: 0,
      started_at: None,
      completed_at: None,
    }
  }

  /// Apply a transition whose legality has already been checked.
  pub(crate) fn apply(&mut self, transition: NodeTransition, now: DateTime<Utc>) {
    match transition {
      NodeTransition::Start { input } => {
        if self.status == NodeStatus::Failed {
          self.retry_count += 1;
        }
        self.status = NodeStatus::Running;
        self.input = Some(input);
        self.output = None;
        self.error = None;
        self.started_at.get_or_insert(now);
        self.completed_at = None;
      }
      NodeTransition::Succeed { output } => {
        self.status = NodeStatus::Success;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(now);
      }
      NodeTransition::Fail { error } => {
        self.status = NodeStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
      }
      NodeTransition::Skip => {
        self.status = NodeStatus::Skipped;
        self.output = None;
        self.completed_at = Some(now);
      }
    }
  }
}

/// A requested change to a [`NodeState`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeTransition {
  /// Move to RUNNING. From FAILED this is a retry and bumps the retry count.
  Start { input: serde_json::Value },
  Succeed { output: serde_json::Value },
  Fail { error: NodeError },
  Skip,
}

impl NodeTransition {
  pub fn target(&self) -> NodeStatus {
    match self {
      NodeTransition::Start { .. } => NodeStatus::Running,
      NodeTransition::Succeed { .. } => NodeStatus::Success,
      NodeTransition::Fail { .. } => NodeStatus::Failed,
      NodeTransition::Skip => NodeStatus::Skipped,
    }
  }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LogLevel {
  Debug,
  Info,
  Warn,
  Error,
}

/// An append-only log record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
  pub execution_id: String,
  /// Position in the execution's event stream, starting at 1.
  pub sequence: u64,
  pub node_id: Option<String>,
  pub level: LogLevel,
  pub message: String,
  pub metadata: serde_json::Value,
  pub timestamp: DateTime<Utc>,
}

/// Accumulated context of an execution: variables plus the outputs of every
/// node whose success has been recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
  pub variables: serde_json::Map<String, serde_json::Value>,
  pub outputs: serde_json::Map<String, serde_json::Value>,
}
