use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use trellis_config::TriggerKind;

use crate::{
  Execution, ExecutionContext, ExecutionLogEntry, ExecutionStatus, ExecutionStore, LogLevel,
  NodeError, NodeState, NodeStatus, NodeTransition, StoreError, check_execution_transition,
  check_node_transition,
};

/// SQLite-based store implementation.
///
/// Writes go through a single pooled connection so that the read-check-write
/// of a compare-and-set never races another writer.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url` and run migrations.
  ///
  /// `sqlite::memory:` gives a private in-memory database. The pool holds
  /// its single connection for the store's whole lifetime, since an
  /// in-memory database disappears with the connection that owns it.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .foreign_keys(true)
      .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .min_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }
}

#[derive(FromRow)]
struct ExecutionRow {
  execution_id: String,
  workflow_id: String,
  workflow_version: i64,
  status: ExecutionStatus,
  trigger_kind: String,
  trigger_payload: Json<serde_json::Value>,
  variables: Json<serde_json::Map<String, serde_json::Value>>,
  user_id: Option<String>,
  created_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  completed_at: Option<DateTime<Utc>>,
  error: Option<String>,
}

impl TryFrom<ExecutionRow> for Execution {
  type Error = StoreError;

  fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
    let trigger_kind = TriggerKind::from_str(&row.trigger_kind).map_err(StoreError::Corrupt)?;
    let workflow_version = u32::try_from(row.workflow_version).map_err(|_| {
      StoreError::Corrupt(format!(
        "execution '{}' has invalid version {}",
        row.execution_id, row.workflow_version
      ))
    })?;
    Ok(Execution {
      execution_id: row.execution_id,
      workflow_id: row.workflow_id,
      workflow_version,
      status: row.status,
      trigger_kind,
      trigger_payload: row.trigger_payload.0,
      variables: row.variables.0,
      user_id: row.user_id,
      created_at: row.created_at,
      started_at: row.started_at,
      completed_at: row.completed_at,
      error: row.error,
    })
  }
}

#[derive(FromRow)]
struct NodeStateRow {
  execution_id: String,
  node_id: String,
  status: NodeStatus,
  input: Option<Json<serde_json::Value>>,
  output: Option<Json<serde_json::Value>>,
  error: Option<Json<NodeError>>,
  retry_count: i64,
  started_at: Option<DateTime<Utc>>,
  completed_at: Option<DateTime<Utc>>,
}

impl From<NodeStateRow> for NodeState {
  fn from(row: NodeStateRow) -> Self {
    NodeState {
      execution_id: row.execution_id,
      node_id: row.node_id,
      status: row.status,
      input: row.input.map(|j| j.0),
      output: row.output.map(|j| j.0),
      error: row.error.map(|j| j.0),
      retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
      started_at: row.started_at,
      completed_at: row.completed_at,
    }
  }
}

#[derive(FromRow)]
struct LogRow {
  execution_id: String,
  sequence: i64,
  node_id: Option<String>,
  level: LogLevel,
  message: String,
  metadata: Json<serde_json::Value>,
  timestamp: DateTime<Utc>,
}

impl From<LogRow> for ExecutionLogEntry {
  fn from(row: LogRow) -> Self {
    ExecutionLogEntry {
      execution_id: row.execution_id,
      sequence: u64::try_from(row.sequence).unwrap_or_default(),
      node_id: row.node_id,
      level: row.level,
      message: row.message,
      metadata: row.metadata.0,
      timestamp: row.timestamp,
    }
  }
}

const EXECUTION_COLUMNS: &str = "execution_id, workflow_id, workflow_version, status, trigger_kind, \
  trigger_payload, variables, user_id, created_at, started_at, completed_at, error";

const NODE_COLUMNS: &str =
  "execution_id, node_id, status, input, output, error, retry_count, started_at, completed_at";

fn not_found_execution(execution_id: &str) -> StoreError {
  StoreError::NotFound(format!("execution '{}'", execution_id))
}

fn not_found_node(execution_id: &str, node_id: &str) -> StoreError {
  StoreError::NotFound(format!(
    "node '{}' in execution '{}'",
    node_id, execution_id
  ))
}

#[async_trait]
impl ExecutionStore for SqliteStore {
  async fn create_execution(&self, execution: &Execution, node_ids: &[String]) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    let exists: Option<(String,)> =
      sqlx::query_as("SELECT execution_id FROM executions WHERE execution_id = ?")
        .bind(&execution.execution_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_some() {
      return Err(StoreError::AlreadyExists(format!(
        "execution '{}'",
        execution.execution_id
      )));
    }

    sqlx::query(&format!(
      "INSERT INTO executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      EXECUTION_COLUMNS
    ))
    .bind(&execution.execution_id)
    .bind(&execution.workflow_id)
    .bind(i64::from(execution.workflow_version))
    .bind(execution.status)
    .bind(execution.trigger_kind.as_str())
    .bind(Json(&execution.trigger_payload))
    .bind(Json(&execution.variables))
    .bind(&execution.user_id)
    .bind(execution.created_at)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(&execution.error)
    .execute(&mut *tx)
    .await?;

    for (position, node_id) in node_ids.iter().enumerate() {
      sqlx::query(
        r#"
        INSERT INTO node_states (execution_id, node_id, position, status, retry_count)
        VALUES (?, ?, ?, ?, 0)
        "#,
      )
      .bind(&execution.execution_id)
      .bind(node_id)
      .bind(position as i64)
      .bind(NodeStatus::Pending)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<Execution, StoreError> {
    let row: Option<ExecutionRow> = sqlx::query_as(&format!(
      "SELECT {} FROM executions WHERE execution_id = ?",
      EXECUTION_COLUMNS
    ))
    .bind(execution_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .ok_or_else(|| not_found_execution(execution_id))?
      .try_into()
  }

  async fn list_executions(&self, workflow_id: &str) -> Result<Vec<Execution>, StoreError> {
    let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
      "SELECT {} FROM executions WHERE workflow_id = ? ORDER BY created_at DESC",
      EXECUTION_COLUMNS
    ))
    .bind(workflow_id)
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(Execution::try_from).collect()
  }

  async fn update_execution_status(
    &self,
    execution_id: &str,
    expected: &[ExecutionStatus],
    status: ExecutionStatus,
    error: Option<String>,
  ) -> Result<Execution, StoreError> {
    let mut tx = self.pool.begin().await?;

    let row: Option<ExecutionRow> = sqlx::query_as(&format!(
      "SELECT {} FROM executions WHERE execution_id = ?",
      EXECUTION_COLUMNS
    ))
    .bind(execution_id)
    .fetch_optional(&mut *tx)
    .await?;
    let mut execution: Execution = row
      .ok_or_else(|| not_found_execution(execution_id))?
      .try_into()?;

    check_execution_transition(&execution, expected)?;
    let previous = execution.status;
    execution.apply_status(status, error, Utc::now());

    let result = sqlx::query(
      r#"
      UPDATE executions
      SET status = ?, started_at = ?, completed_at = ?, error = ?
      WHERE execution_id = ? AND status = ?
      "#,
    )
    .bind(execution.status)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(&execution.error)
    .bind(execution_id)
    .bind(previous)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
      return Err(StoreError::Conflict {
        id: execution_id.to_string(),
        expected: format!("{:?}", previous),
        actual: "concurrently modified".to_string(),
      });
    }

    tx.commit().await?;
    Ok(execution)
  }

  async fn get_node_state(&self, execution_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
    let row: Option<NodeStateRow> = sqlx::query_as(&format!(
      "SELECT {} FROM node_states WHERE execution_id = ? AND node_id = ?",
      NODE_COLUMNS
    ))
    .bind(execution_id)
    .bind(node_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(NodeState::from)
      .ok_or_else(|| not_found_node(execution_id, node_id))
  }

  async fn list_node_states(&self, execution_id: &str) -> Result<Vec<NodeState>, StoreError> {
    // Surface a missing execution as NotFound rather than an empty list.
    self.get_execution(execution_id).await?;

    let rows: Vec<NodeStateRow> = sqlx::query_as(&format!(
      "SELECT {} FROM node_states WHERE execution_id = ? ORDER BY position ASC",
      NODE_COLUMNS
    ))
    .bind(execution_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(NodeState::from).collect())
  }

  async fn transition_node(
    &self,
    execution_id: &str,
    node_id: &str,
    expected: NodeStatus,
    transition: NodeTransition,
  ) -> Result<NodeState, StoreError> {
    let mut tx = self.pool.begin().await?;

    let row: Option<NodeStateRow> = sqlx::query_as(&format!(
      "SELECT {} FROM node_states WHERE execution_id = ? AND node_id = ?",
      NODE_COLUMNS
    ))
    .bind(execution_id)
    .bind(node_id)
    .fetch_optional(&mut *tx)
    .await?;
    let mut state: NodeState = row
      .map(NodeState::from)
      .ok_or_else(|| not_found_node(execution_id, node_id))?;

    check_node_transition(&state, expected, &transition)?;
    state.apply(transition, Utc::now());

    let result = sqlx::query(
      r#"
      UPDATE node_states
      SET status = ?, input = ?, output = ?, error = ?, retry_count = ?,
          started_at = ?, completed_at = ?
      WHERE execution_id = ? AND node_id = ? AND status = ?
      "#,
    )
    .bind(state.status)
    .bind(state.input.as_ref().map(Json))
    .bind(state.output.as_ref().map(Json))
    .bind(state.error.as_ref().map(Json))
    .bind(i64::from(state.retry_count))
    .bind(state.started_at)
    .bind(state.completed_at)
    .bind(execution_id)
    .bind(node_id)
    .bind(expected)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
      return Err(StoreError::Conflict {
        id: node_id.to_string(),
        expected: format!("{:?}", expected),
        actual: "concurrently modified".to_string(),
      });
    }

    tx.commit().await?;
    Ok(state)
  }

  async fn context(&self, execution_id: &str) -> Result<ExecutionContext, StoreError> {
    let mut tx = self.pool.begin().await?;

    let variables: Option<(Json<serde_json::Map<String, serde_json::Value>>,)> =
      sqlx::query_as("SELECT variables FROM executions WHERE execution_id = ?")
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?;
    let variables = variables
      .ok_or_else(|| not_found_execution(execution_id))?
      .0
      .0;

    let outputs: Vec<(String, Option<Json<serde_json::Value>>)> = sqlx::query_as(
      r#"
      SELECT node_id, output FROM node_states
      WHERE execution_id = ? AND status = ?
      ORDER BY position ASC
      "#,
    )
    .bind(execution_id)
    .bind(NodeStatus::Success)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(ExecutionContext {
      variables,
      outputs: outputs
        .into_iter()
        .filter_map(|(node_id, output)| output.map(|o| (node_id, o.0)))
        .collect(),
    })
  }

  async fn append_logs(&self, entries: &[ExecutionLogEntry]) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    for entry in entries {
      let sequence = i64::try_from(entry.sequence)
        .map_err(|_| StoreError::Corrupt(format!("log sequence {} out of range", entry.sequence)))?;
      sqlx::query(
        r#"
        INSERT INTO execution_logs (execution_id, sequence, node_id, level, message, metadata, timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
      )
      .bind(&entry.execution_id)
      .bind(sequence)
      .bind(&entry.node_id)
      .bind(entry.level)
      .bind(&entry.message)
      .bind(Json(&entry.metadata))
      .bind(entry.timestamp)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn list_logs(&self, execution_id: &str, since: Option<u64>) -> Result<Vec<ExecutionLogEntry>, StoreError> {
    self.get_execution(execution_id).await?;

    let since = since
      .map(|s| i64::try_from(s).unwrap_or(i64::MAX))
      .unwrap_or(0);

    let rows: Vec<LogRow> = sqlx::query_as(
      r#"
      SELECT execution_id, sequence, node_id, level, message, metadata, timestamp
      FROM execution_logs
      WHERE execution_id = ? AND sequence > ?
      ORDER BY sequence ASC
      "#,
    )
    .bind(execution_id)
    .bind(since)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(ExecutionLogEntry::from).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  async fn memory_store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:").await.unwrap()
  }

  fn execution(id: &str) -> Execution {
    let mut execution = Execution::new(id, "wf", 2, TriggerKind::Webhook, json!({ "body": 1 }));
    execution.variables.insert("region".to_string(), json!("eu"));
    execution.user_id = Some("user-1".to_string());
    execution
  }

  #[tokio::test]
  async fn test_execution_round_trip() {
    let store = memory_store().await;
    store
      .create_execution(&execution("e1"), &["a".to_string(), "b".to_string()])
      .await
      .unwrap();

    let loaded = store.get_execution("e1").await.unwrap();
    assert_eq!(loaded.workflow_version, 2);
    assert_eq!(loaded.trigger_kind, TriggerKind::Webhook);
    assert_eq!(loaded.trigger_payload["body"], 1);
    assert_eq!(loaded.user_id.as_deref(), Some("user-1"));
    assert_eq!(loaded.status, ExecutionStatus::Pending);

    let states = store.list_node_states("e1").await.unwrap();
    assert_eq!(
      states.iter().map(|s| s.node_id.as_str()).collect::<Vec<_>>(),
      vec!["a", "b"]
    );

    assert_eq!(store.list_executions("wf").await.unwrap().len(), 1);
    assert!(store.list_executions("other").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_node_lifecycle_with_retry() {
    let store = memory_store().await;
    store
      .create_execution(&execution("e1"), &["a".to_string()])
      .await
      .unwrap();

    store
      .transition_node("e1", "a", NodeStatus::Pending, NodeTransition::Start { input: json!({ "x": 1 }) })
      .await
      .unwrap();
    store
      .transition_node(
        "e1",
        "a",
        NodeStatus::Running,
        NodeTransition::Fail {
          error: NodeError::timeout("too slow"),
        },
      )
      .await
      .unwrap();

    let failed = store.get_node_state("e1", "a").await.unwrap();
    assert_eq!(failed.status, NodeStatus::Failed);
    assert_eq!(failed.error.as_ref().map(|e| e.kind), Some(crate::ErrorKind::Timeout));

    store
      .transition_node("e1", "a", NodeStatus::Failed, NodeTransition::Start { input: json!({ "x": 2 }) })
      .await
      .unwrap();
    let done = store
      .transition_node(
        "e1",
        "a",
        NodeStatus::Running,
        NodeTransition::Succeed { output: json!([1, 2]) },
      )
      .await
      .unwrap();

    assert_eq!(done.retry_count, 1);
    assert_eq!(done.status, NodeStatus::Success);

    let context = store.context("e1").await.unwrap();
    assert_eq!(context.outputs["a"], json!([1, 2]));
    assert_eq!(context.variables["region"], "eu");
  }

  #[tokio::test]
  async fn test_conflicting_transition() {
    let store = memory_store().await;
    store
      .create_execution(&execution("e1"), &["a".to_string()])
      .await
      .unwrap();

    store
      .transition_node("e1", "a", NodeStatus::Pending, NodeTransition::Start { input: json!(null) })
      .await
      .unwrap();
    let again = store
      .transition_node("e1", "a", NodeStatus::Pending, NodeTransition::Start { input: json!(null) })
      .await;

    assert!(matches!(again, Err(StoreError::Conflict { .. })));
  }

  #[tokio::test]
  async fn test_execution_status_and_logs() {
    let store = memory_store().await;
    store.create_execution(&execution("e1"), &[]).await.unwrap();

    store
      .update_execution_status("e1", &[ExecutionStatus::Pending], ExecutionStatus::Running, None)
      .await
      .unwrap();
    let failed = store
      .update_execution_status(
        "e1",
        &[ExecutionStatus::Running],
        ExecutionStatus::Failed,
        Some("node 'a' failed".to_string()),
      )
      .await
      .unwrap();
    assert!(failed.duration().is_some());

    let reloaded = store.get_execution("e1").await.unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Failed);
    assert_eq!(reloaded.error.as_deref(), Some("node 'a' failed"));

    let now = Utc::now();
    let entries: Vec<ExecutionLogEntry> = (1..=4)
      .map(|sequence| ExecutionLogEntry {
        execution_id: "e1".to_string(),
        sequence,
        node_id: (sequence % 2 == 0).then(|| "a".to_string()),
        level: LogLevel::Info,
        message: format!("line {}", sequence),
        metadata: json!({ "n": sequence }),
        timestamp: now,
      })
      .collect();
    store.append_logs(&entries).await.unwrap();

    let tail = store.list_logs("e1", Some(2)).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].sequence, 3);
    assert_eq!(tail[1].node_id.as_deref(), Some("a"));
    assert_eq!(tail[1].metadata["n"], 4);
  }

  #[tokio::test]
  async fn test_logs_of_unknown_execution() {
    let store = memory_store().await;
    let result = store.list_logs("missing", None).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));

    store.create_execution(&execution("e1"), &[]).await.unwrap();
    assert!(store.list_logs("e1", None).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_memory_database_keeps_its_connection() {
    let store = memory_store().await;
    let options = store.pool.options();
    assert_eq!(options.get_min_connections(), 1);
    assert_eq!(options.get_idle_timeout(), None);
    assert_eq!(options.get_max_lifetime(), None);

    store.create_execution(&execution("e1"), &[]).await.unwrap();
    assert_eq!(store.pool.size(), 1);
    assert_eq!(store.get_execution("e1").await.unwrap().workflow_id, "wf");
  }

  #[tokio::test]
  async fn test_file_database_persists() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("trellis.db").display());

    {
      let store = SqliteStore::connect(&url).await.unwrap();
      store.create_execution(&execution("e1"), &["a".to_string()]).await.unwrap();
    }

    let reopened = SqliteStore::connect(&url).await.unwrap();
    assert_eq!(reopened.get_execution("e1").await.unwrap().workflow_id, "wf");
  }
}
