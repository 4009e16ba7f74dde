use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_config::RetryPolicy;

fn default_node_timeout_ms() -> u64 {
  300_000
}

fn default_event_buffer() -> usize {
  256
}

/// Engine-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Deadline for nodes when neither the node nor its workflow sets one.
  #[serde(default = "default_node_timeout_ms")]
  pub default_node_timeout_ms: u64,
  /// Live events buffered per subscriber before it starts lagging.
  #[serde(default = "default_event_buffer")]
  pub event_buffer: usize,
  /// Retry policy when neither the node nor its workflow sets one.
  #[serde(default)]
  pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      default_node_timeout_ms: default_node_timeout_ms(),
      event_buffer: default_event_buffer(),
      default_retry: RetryPolicy::disabled(),
    }
  }
}

impl EngineConfig {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  pub fn default_node_timeout(&self) -> Duration {
    Duration::from_millis(self.default_node_timeout_ms)
  }
}
