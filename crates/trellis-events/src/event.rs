use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_store::{ExecutionLogEntry, ExecutionStatus, LogLevel, NodeStatus};

/// What an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
  /// A node changed status.
  NodeUpdated,
  /// A node (or the engine on its behalf) wrote a log line.
  LogNew,
  /// The execution changed to a non-terminal status.
  ExecutionUpdated,
  /// The execution reached a terminal status.
  ExecutionCompleted,
}

impl EventKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EventKind::NodeUpdated => "NODE_UPDATED",
      EventKind::LogNew => "LOG_NEW",
      EventKind::ExecutionUpdated => "EXECUTION_UPDATED",
      EventKind::ExecutionCompleted => "EXECUTION_COMPLETED",
    }
  }
}

/// The new status carried by a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
  Node(NodeStatus),
  Execution(ExecutionStatus),
}

/// An ordered event within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
  pub execution_id: String,
  /// Monotonic per execution, starting at 1.
  pub sequence: u64,
  pub kind: EventKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<EventStatus>,
  pub level: LogLevel,
  pub message: String,
  #[serde(default)]
  pub payload: serde_json::Value,
  pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
  /// The log entry persisted for this event.
  pub fn to_log_entry(&self) -> ExecutionLogEntry {
    let mut metadata = serde_json::Map::new();
    metadata.insert("event".to_string(), self.kind.as_str().into());
    if let Some(status) = self.status {
      let status = serde_json::to_value(status).unwrap_or(serde_json::Value::Null);
      metadata.insert("status".to_string(), status);
    }
    if !self.payload.is_null() {
      metadata.insert("payload".to_string(), self.payload.clone());
    }

    ExecutionLogEntry {
      execution_id: self.execution_id.clone(),
      sequence: self.sequence,
      node_id: self.node_id.clone(),
      level: self.level,
      message: self.message.clone(),
      metadata: serde_json::Value::Object(metadata),
      timestamp: self.timestamp,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_log_entry_carries_event_metadata() {
    let event = ExecutionEvent {
      execution_id: "e1".to_string(),
      sequence: 7,
      kind: EventKind::NodeUpdated,
      node_id: Some("fetch".to_string()),
      status: Some(EventStatus::Node(NodeStatus::Failed)),
      level: LogLevel::Error,
      message: "node 'fetch' failed".to_string(),
      payload: json!({ "kind": "timeout" }),
      timestamp: Utc::now(),
    };

    let entry = event.to_log_entry();
    assert_eq!(entry.sequence, 7);
    assert_eq!(entry.node_id.as_deref(), Some("fetch"));
    assert_eq!(entry.metadata["event"], "NODE_UPDATED");
    assert_eq!(entry.metadata["status"], json!({ "node": "failed" }));
    assert_eq!(entry.metadata["payload"]["kind"], "timeout");
  }

  #[test]
  fn test_kind_serializes_screaming() {
    assert_eq!(
      serde_json::to_value(EventKind::ExecutionCompleted).unwrap(),
      json!("EXECUTION_COMPLETED")
    );
  }
}
