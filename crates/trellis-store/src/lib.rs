//! Trellis Store
//!
//! This crate provides the execution state store: the durable record of
//! executions, per-node states and execution logs.
//!
//! The [`ExecutionStore`] trait defines operations for:
//! - Creating executions together with one pending [`NodeState`] per node
//! - Compare-and-set status transitions for executions and nodes
//! - Reading the accumulated [`ExecutionContext`] of a run
//! - Appending and replaying [`ExecutionLogEntry`] records
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! single-process use, and [`SqliteStore`] backed by sqlx.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
  ErrorKind, Execution, ExecutionContext, ExecutionLogEntry, ExecutionStatus, LogLevel, NodeError,
  NodeState, NodeStatus, NodeTransition,
};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A record with the same key already exists.
  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// A compare-and-set found a different status than expected.
  #[error("conflict on '{id}': expected {expected}, found {actual}")]
  Conflict {
    id: String,
    expected: String,
    actual: String,
  },

  /// The requested transition is not allowed by the state machine.
  #[error("illegal transition for '{id}': {from} -> {to}")]
  IllegalTransition { id: String, from: String, to: String },

  /// A stored value could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Schema migration failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Storage trait for executions, node states and logs.
///
/// Every status change is a compare-and-set: callers state the status they
/// expect and get [`StoreError::Conflict`] if someone else moved first.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
  /// Create an execution and a pending state for each node, atomically.
  async fn create_execution(&self, execution: &Execution, node_ids: &[String]) -> Result<(), StoreError>;

  /// Get an execution by ID.
  async fn get_execution(&self, execution_id: &str) -> Result<Execution, StoreError>;

  /// List executions for a workflow, newest first.
  async fn list_executions(&self, workflow_id: &str) -> Result<Vec<Execution>, StoreError>;

  /// Move an execution to `status` if it is currently in one of `expected`.
  ///
  /// `error` is recorded when present. Returns the updated record.
  async fn update_execution_status(
    &self,
    execution_id: &str,
    expected: &[ExecutionStatus],
    status: ExecutionStatus,
    error: Option<String>,
  ) -> Result<Execution, StoreError>;

  /// Get one node's state.
  async fn get_node_state(&self, execution_id: &str, node_id: &str) -> Result<NodeState, StoreError>;

  /// All node states of an execution, in workflow definition order.
  async fn list_node_states(&self, execution_id: &str) -> Result<Vec<NodeState>, StoreError>;

  /// Apply `transition` if the node is currently in `expected`.
  ///
  /// A successful transition to SUCCESS also publishes the output into the
  /// execution context in the same atomic step.
  async fn transition_node(
    &self,
    execution_id: &str,
    node_id: &str,
    expected: NodeStatus,
    transition: NodeTransition,
  ) -> Result<NodeState, StoreError>;

  /// Variables plus outputs of nodes whose success has been recorded.
  async fn context(&self, execution_id: &str) -> Result<ExecutionContext, StoreError>;

  /// Append log entries.
  async fn append_logs(&self, entries: &[ExecutionLogEntry]) -> Result<(), StoreError>;

  /// Log entries with a sequence greater than `since`, in sequence order.
  async fn list_logs(&self, execution_id: &str, since: Option<u64>) -> Result<Vec<ExecutionLogEntry>, StoreError>;
}

/// Check a node transition against the current state.
pub(crate) fn check_node_transition(
  state: &NodeState,
  expected: NodeStatus,
  transition: &NodeTransition,
) -> Result<(), StoreError> {
  if state.status != expected {
    return Err(StoreError::Conflict {
      id: state.node_id.clone(),
      expected: format!("{:?}", expected),
      actual: format!("{:?}", state.status),
    });
  }
  let target = transition.target();
  if !state.status.can_transition(target) {
    return Err(StoreError::IllegalTransition {
      id: state.node_id.clone(),
      from: format!("{:?}", state.status),
      to: format!("{:?}", target),
    });
  }
  Ok(())
}

/// Check an execution status change against the current record.
pub(crate) fn check_execution_transition(
  execution: &Execution,
  expected: &[ExecutionStatus],
) -> Result<(), StoreError> {
  if !expected.contains(&execution.status) {
    return Err(StoreError::Conflict {
      id: execution.execution_id.clone(),
      expected: format!("{:?}", expected),
      actual: format!("{:?}", execution.status),
    });
  }
  Ok(())
}
