use trellis_store::{ExecutionStatus, StoreError};
use trellis_workflow::WorkflowError;

/// Errors surfaced by the engine API.
///
/// Node failures never appear here; they are recorded on the node state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("workflow '{workflow_id}' not found{}", version.map(|v| format!(" at version {}", v)).unwrap_or_default())]
  WorkflowNotFound {
    workflow_id: String,
    version: Option<u32>,
  },

  #[error("invalid workflow: {0}")]
  InvalidWorkflow(#[from] WorkflowError),

  #[error("execution '{execution_id}' not found")]
  ExecutionNotFound { execution_id: String },

  /// The requested control action does not apply to the current status.
  #[error("execution '{execution_id}' is {status:?} and cannot be {action}")]
  InvalidState {
    execution_id: String,
    status: ExecutionStatus,
    action: &'static str,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl EngineError {
  /// Map a store error from a lookup of `execution_id`.
  pub(crate) fn lookup(execution_id: &str) -> impl FnOnce(StoreError) -> EngineError + '_ {
    move |e| match e {
      StoreError::NotFound(_) => EngineError::ExecutionNotFound {
        execution_id: execution_id.to_string(),
      },
      other => EngineError::Store(other),
    }
  }
}
