use serde::{Deserialize, Serialize};

/// Handle name used when a connection does not name one.
pub const MAIN_HANDLE: &str = "main";

fn main_handle() -> String {
  MAIN_HANDLE.to_string()
}

/// A directed connection from one node's output handle to another node's
/// input handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDef {
  pub source: String,
  #[serde(default = "main_handle")]
  pub source_handle: String,
  pub target: String,
  #[serde(default = "main_handle")]
  pub target_handle: String,
}

impl ConnectionDef {
  /// Connect the main output of `source` to the main input of `target`.
  pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      source_handle: main_handle(),
      target: target.into(),
      target_handle: main_handle(),
    }
  }
}
