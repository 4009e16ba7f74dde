use serde::{Deserialize, Serialize};

/// Delay strategy applied between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
  #[default]
  Fixed,
  Linear,
  Exponential,
}

/// What fired an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
  #[default]
  Manual,
  Webhook,
  Schedule,
  Event,
}

impl TriggerKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      TriggerKind::Manual => "manual",
      TriggerKind::Webhook => "webhook",
      TriggerKind::Schedule => "schedule",
      TriggerKind::Event => "event",
    }
  }
}

impl std::fmt::Display for TriggerKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for TriggerKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "manual" => Ok(TriggerKind::Manual),
      "webhook" => Ok(TriggerKind::Webhook),
      "schedule" => Ok(TriggerKind::Schedule),
      "event" => Ok(TriggerKind::Event),
      other => Err(format!("unknown trigger kind '{}'", other)),
    }
  }
}
