use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub node_id: String,
  /// Key into the node registry, e.g. "http_request".
  #[serde(rename = "type")]
  pub node_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Editor canvas position. Carried through, never interpreted.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<[f64; 2]>,
  #[serde(default)]
  pub config: serde_json::Value,
  /// Credential slot name -> credential id.
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub credentials: HashMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicy>,
  #[serde(default)]
  pub continue_on_error: bool,
  #[serde(default)]
  pub disabled: bool,
}

impl NodeDef {
  /// A node of the given type with an empty config and default policies.
  pub fn new(node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      node_type: node_type.into(),
      name: None,
      position: None,
      config: serde_json::Value::Object(Default::default()),
      credentials: HashMap::new(),
      timeout_ms: None,
      retry: None,
      continue_on_error: false,
      disabled: false,
    }
  }

  pub fn with_config(mut self, config: serde_json::Value) -> Self {
    self.config = config;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = Some(timeout_ms);
    self
  }

  pub fn with_credential(mut self, slot: impl Into<String>, credential_id: impl Into<String>) -> Self {
    self.credentials.insert(slot.into(), credential_id.into());
    self
  }

  pub fn continue_on_error(mut self) -> Self {
    self.continue_on_error = true;
    self
  }

  pub fn disabled(mut self) -> Self {
    self.disabled = true;
    self
  }
}
