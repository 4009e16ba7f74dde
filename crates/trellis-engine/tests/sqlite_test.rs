//! Executions persisted through the SQLite store.

mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;
use trellis_config::{NodeDef, RetryPolicy};
use trellis_engine::{Engine, EngineError, InMemoryWorkflows};
use trellis_store::{ExecutionStatus, ExecutionStore, NodeStatus, SqliteStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execution_survives_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("trellis.db").display());
  let flaky = FlakyNode::new(1);

  let id = {
    let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let source = InMemoryWorkflows::new();
    source.insert(workflow(
      "persisted",
      vec![
        NodeDef::new("a", "flaky").with_retry(RetryPolicy::fixed(2, 10)),
        NodeDef::new("b", "passthrough"),
      ],
      &[("a", "b")],
    ));
    let engine = Engine::builder(Arc::new(registry().with("flaky", flaky.clone())))
      .store(store)
      .workflows(Arc::new(source))
      .build();

    let id = engine
      .start_execution("persisted", None, json!({ "order": 42 }))
      .await
      .unwrap();
    let execution = engine.wait_for_completion(&id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    id
  };

  let store = SqliteStore::connect(&url).await.unwrap();
  let execution = store.get_execution(&id).await.unwrap();
  assert_eq!(execution.status, ExecutionStatus::Success);
  assert_eq!(execution.trigger_payload, json!({ "order": 42 }));

  let states = store.list_node_states(&id).await.unwrap();
  let a = state(&states, "a");
  assert_eq!(a.status, NodeStatus::Success);
  assert_eq!(a.retry_count, 1);
  assert_eq!(state(&states, "b").output, Some(json!({ "ok": true })));

  let logs = store.list_logs(&id, None).await.unwrap();
  assert!(logs.windows(2).all(|w| w[0].sequence < w[1].sequence));
  assert_eq!(logs.last().map(|l| l.metadata["event"].clone()), Some(json!("EXECUTION_COMPLETED")));
}

#[tokio::test]
async fn test_logs_of_unknown_execution_are_not_found() {
  let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
  let engine = Engine::builder(Arc::new(registry()))
    .store(store)
    .workflows(Arc::new(InMemoryWorkflows::new()))
    .build();

  let result = engine.get_execution_logs("missing", None).await;
  assert!(matches!(result, Err(EngineError::ExecutionNotFound { .. })));
}
