use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMeta {
  pub id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowMeta {
  pub id: String,
  pub version: u32,
}

/// Everything an expression may reference.
///
/// `nodes` must only contain outputs of nodes whose success has already been
/// recorded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Scope {
  pub nodes: serde_json::Map<String, serde_json::Value>,
  pub vars: serde_json::Map<String, serde_json::Value>,
  pub execution: ExecutionMeta,
  pub workflow: WorkflowMeta,
  /// RFC 3339 timestamp taken when the scope was built.
  pub now: String,
  pub trigger: serde_json::Value,
  pub input: serde_json::Value,
}
