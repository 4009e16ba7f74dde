use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
  Execution, ExecutionContext, ExecutionLogEntry, ExecutionStatus, ExecutionStore, NodeState,
  NodeStatus, NodeTransition, StoreError, check_execution_transition, check_node_transition,
};

struct Record {
  execution: Execution,
  /// Node states in definition order.
  nodes: Vec<NodeState>,
  index: HashMap<String, usize>,
  logs: Vec<ExecutionLogEntry>,
}

/// In-memory store.
///
/// All records live behind one mutex, so every operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
  records: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Record>> {
    self.records.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn record<'a>(
  records: &'a mut HashMap<String, Record>,
  execution_id: &str,
) -> Result<&'a mut Record, StoreError> {
  records
    .get_mut(execution_id)
    .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", execution_id)))
}

fn node_index(record: &Record, node_id: &str) -> Result<usize, StoreError> {
  record.index.get(node_id).copied().ok_or_else(|| {
    StoreError::NotFound(format!(
      "node '{}' in execution '{}'",
      node_id, record.execution.execution_id
    ))
  })
}

#[async_trait]
impl ExecutionStore for MemoryStore {
  async fn create_execution(&self, execution: &Execution, node_ids: &[String]) -> Result<(), StoreError> {
    let mut records = self.lock();
    if records.contains_key(&execution.execution_id) {
      return Err(StoreError::AlreadyExists(format!(
        "execution '{}'",
        execution.execution_id
      )));
    }

    let nodes: Vec<NodeState> = node_ids
      .iter()
      .map(|id| NodeState::pending(&execution.execution_id, id))
      .collect();
    let index = node_ids
      .iter()
      .enumerate()
      .map(|(i, id)| (id.clone(), i))
      .collect();

    records.insert(
      execution.execution_id.clone(),
      Record {
        execution: execution.clone(),
        nodes,
        index,
        logs: Vec::new(),
      },
    );
    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<Execution, StoreError> {
    let mut records = self.lock();
    Ok(record(&mut records, execution_id)?.execution.clone())
  }

  async fn list_executions(&self, workflow_id: &str) -> Result<Vec<Execution>, StoreError> {
    let records = self.lock();
    let mut executions: Vec<Execution> = records
      .values()
      .filter(|r| r.execution.workflow_id == workflow_id)
      .map(|r| r.execution.clone())
      .collect();
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(executions)
  }

  async fn update_execution_status(
    &self,
    execution_id: &str,
    expected: &[ExecutionStatus],
    status: ExecutionStatus,
    error: Option<String>,
  ) -> Result<Execution, StoreError> {
    let mut records = self.lock();
    let record = record(&mut records, execution_id)?;
    check_execution_transition(&record.execution, expected)?;
    record.execution.apply_status(status, error, Utc::now());
    Ok(record.execution.clone())
  }

  async fn get_node_state(&self, execution_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
    let mut records = self.lock();
    let record = record(&mut records, execution_id)?;
    let i = node_index(record, node_id)?;
    Ok(record.nodes[i].clone())
  }

  async fn list_node_states(&self, execution_id: &str) -> Result<Vec<NodeState>, StoreError> {
    let mut records = self.lock();
    Ok(record(&mut records, execution_id)?.nodes.clone())
  }

  async fn transition_node(
    &self,
    execution_id: &str,
    node_id: &str,
    expected: NodeStatus,
    transition: NodeTransition,
  ) -> Result<NodeState, StoreError> {
    let mut records = self.lock();
    let record = record(&mut records, execution_id)?;
    let i = node_index(record, node_id)?;
    let state = &mut record.nodes[i];
    check_node_transition(state, expected, &transition)?;
    state.apply(transition, Utc::now());
    Ok(state.clone())
  }

  async fn context(&self, execution_id: &str) -> Result<ExecutionContext, StoreError> {
    let mut records = self.lock();
    let record = record(&mut records, execution_id)?;
    let outputs = record
      .nodes
      .iter()
      .filter(|n| n.status == NodeStatus::Success)
      .filter_map(|n| n.output.clone().map(|o| (n.node_id.clone(), o)))
      .collect();
    Ok(ExecutionContext {
      variables: record.execution.variables.clone(),
      outputs,
    })
  }

  async fn append_logs(&self, entries: &[ExecutionLogEntry]) -> Result<(), StoreError> {
    let mut records = self.lock();
    for entry in entries {
      record(&mut records, &entry.execution_id)?.logs.push(entry.clone());
    }
    Ok(())
  }

  async fn list_logs(&self, execution_id: &str, since: Option<u64>) -> Result<Vec<ExecutionLogEntry>, StoreError> {
    let mut records = self.lock();
    let record = record(&mut records, execution_id)?;
    let mut logs: Vec<ExecutionLogEntry> = record
      .logs
      .iter()
      .filter(|e| since.is_none_or(|s| e.sequence > s))
      .cloned()
      .collect();
    logs.sort_by_key(|e| e.sequence);
    Ok(logs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{LogLevel, NodeError};
  use serde_json::json;
  use trellis_config::TriggerKind;

  async fn store_with_execution() -> MemoryStore {
    let store = MemoryStore::new();
    let mut execution = Execution::new("exec-1", "wf", 1, TriggerKind::Manual, json!({}));
    execution.variables.insert("region".to_string(), json!("eu"));
    store
      .create_execution(&execution, &["a".to_string(), "b".to_string()])
      .await
      .unwrap();
    store
  }

  #[tokio::test]
  async fn test_create_and_get() {
    let store = store_with_execution().await;

    let execution = store.get_execution("exec-1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);

    let states = store.list_node_states("exec-1").await.unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].node_id, "a");
    assert!(states.iter().all(|s| s.status == NodeStatus::Pending));

    let duplicate = Execution::new("exec-1", "wf", 1, TriggerKind::Manual, json!({}));
    assert!(matches!(
      store.create_execution(&duplicate, &[]).await,
      Err(StoreError::AlreadyExists(_))
    ));
  }

  #[tokio::test]
  async fn test_compare_and_set_prevents_double_dispatch() {
    let store = store_with_execution().await;

    let first = store
      .transition_node("exec-1", "a", NodeStatus::Pending, NodeTransition::Start { input: json!({}) })
      .await;
    let second = store
      .transition_node("exec-1", "a", NodeStatus::Pending, NodeTransition::Start { input: json!({}) })
      .await;

    assert!(first.is_ok());
    assert!(matches!(second, Err(StoreError::Conflict { .. })));
  }

  #[tokio::test]
  async fn test_illegal_transition_rejected() {
    let store = store_with_execution().await;

    let result = store
      .transition_node(
        "exec-1",
        "a",
        NodeStatus::Pending,
        NodeTransition::Succeed { output: json!(1) },
      )
      .await;

    assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
  }

  #[tokio::test]
  async fn test_context_only_contains_successful_outputs() {
    let store = store_with_execution().await;

    store
      .transition_node("exec-1", "a", NodeStatus::Pending, NodeTransition::Start { input: json!({}) })
      .await
      .unwrap();
    assert!(store.context("exec-1").await.unwrap().outputs.is_empty());

    store
      .transition_node(
        "exec-1",
        "a",
        NodeStatus::Running,
        NodeTransition::Succeed { output: json!({ "n": 1 }) },
      )
      .await
      .unwrap();
    store
      .transition_node("exec-1", "b", NodeStatus::Pending, NodeTransition::Start { input: json!({}) })
      .await
      .unwrap();
    store
      .transition_node(
        "exec-1",
        "b",
        NodeStatus::Running,
        NodeTransition::Fail {
          error: NodeError::runtime("boom"),
        },
      )
      .await
      .unwrap();

    let context = store.context("exec-1").await.unwrap();
    assert_eq!(context.variables["region"], "eu");
    assert_eq!(context.outputs.len(), 1);
    assert_eq!(context.outputs["a"]["n"], 1);
  }

  #[tokio::test]
  async fn test_execution_status_cas() {
    let store = store_with_execution().await;

    let running = store
      .update_execution_status("exec-1", &[ExecutionStatus::Pending], ExecutionStatus::Running, None)
      .await
      .unwrap();
    assert!(running.started_at.is_some());

    let stale = store
      .update_execution_status("exec-1", &[ExecutionStatus::Pending], ExecutionStatus::Cancelled, None)
      .await;
    assert!(matches!(stale, Err(StoreError::Conflict { .. })));
  }

  #[tokio::test]
  async fn test_logs_since_cursor() {
    let store = store_with_execution().await;
    let entries: Vec<ExecutionLogEntry> = (1..=3)
      .map(|sequence| ExecutionLogEntry {
        execution_id: "exec-1".to_string(),
        sequence,
        node_id: None,
        level: LogLevel::Info,
        message: format!("entry {}", sequence),
        metadata: json!({}),
        timestamp: Utc::now(),
      })
      .collect();
    store.append_logs(&entries).await.unwrap();

    assert_eq!(store.list_logs("exec-1", None).await.unwrap().len(), 3);
    let tail = store.list_logs("exec-1", Some(1)).await.unwrap();
    assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
  }

  #[tokio::test]
  async fn test_unknown_execution() {
    let store = MemoryStore::new();
    assert!(matches!(
      store.get_execution("nope").await,
      Err(StoreError::NotFound(_))
    ));
  }
}
