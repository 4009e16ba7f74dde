use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use trellis_config::{NodeDef, RetryPolicy, WorkflowSettings};

/// A node with its policies resolved against the workflow settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub node_id: String,
  pub node_type: String,
  pub name: Option<String>,
  pub config: serde_json::Value,
  pub credentials: HashMap<String, String>,
  /// Node deadline, falling back to the workflow default. `None` leaves the
  /// choice to the engine.
  pub timeout_ms: Option<u64>,
  /// Retry policy, falling back to the workflow default. `None` leaves the
  /// choice to the engine.
  pub retry: Option<RetryPolicy>,
  pub continue_on_error: bool,
  pub disabled: bool,
  /// Editor canvas position.
  pub position: Option<[f64; 2]>,
}

impl Node {
  pub(crate) fn resolve(def: NodeDef, settings: &WorkflowSettings) -> Self {
    Self {
      node_id: def.node_id,
      node_type: def.node_type,
      name: def.name,
      config: def.config,
      credentials: def.credentials,
      timeout_ms: def.timeout_ms.or(settings.timeout_ms),
      retry: def.retry.or_else(|| settings.default_retry.clone()),
      continue_on_error: def.continue_on_error,
      disabled: def.disabled,
      position: def.position,
    }
  }

  /// Display name, falling back to the node id.
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.node_id)
  }
}
