use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDef;
use crate::node::NodeDef;
use crate::retry::RetryPolicy;

fn first_version() -> u32 {
  1
}

/// Workflow-wide execution settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
  /// Retry policy for nodes that do not declare their own.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub default_retry: Option<RetryPolicy>,
  /// Deadline for nodes that do not declare their own.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  /// Deadline for the whole run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub execution_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub workflow_id: String,
  #[serde(default = "first_version")]
  pub version: u32,
  pub name: String,
  #[serde(default)]
  pub variables: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub settings: WorkflowSettings,
  pub nodes: Vec<NodeDef>,
  #[serde(default)]
  pub connections: Vec<ConnectionDef>,
}
