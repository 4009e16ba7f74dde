//! Expression errors.

/// Errors raised while resolving a node's configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
  /// The expression referenced something that does not exist (yet).
  #[error("unresolved reference in node '{node_id}' at '{path}': {expression}")]
  UnresolvedReference {
    node_id: String,
    path: String,
    expression: String,
  },

  /// The expression could not be parsed or evaluated.
  #[error("invalid expression in node '{node_id}' at '{path}': {message}")]
  InvalidExpression {
    node_id: String,
    path: String,
    message: String,
  },
}

impl ExpressionError {
  /// JSON pointer of the config field that failed.
  pub fn path(&self) -> &str {
    match self {
      ExpressionError::UnresolvedReference { path, .. } => path,
      ExpressionError::InvalidExpression { path, .. } => path,
    }
  }
}
