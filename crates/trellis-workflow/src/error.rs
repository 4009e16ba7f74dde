use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
  #[error("workflow has no nodes")]
  Empty,

  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("connection references unknown node: from={from}, to={to}")]
  InvalidConnection { from: String, to: String },

  #[error("node '{0}' is connected to itself")]
  SelfLoop(String),

  #[error("workflow contains a cycle through: {}", nodes.join(", "))]
  Cycle { nodes: Vec<String> },
}
