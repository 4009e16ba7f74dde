//! Cancel, pause and resume of running executions.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use trellis_config::NodeDef;
use trellis_engine::EngineError;
use trellis_store::{ErrorKind, ExecutionStatus, NodeStatus};

#[tokio::test]
async fn test_cancel_stops_pending_nodes() {
  let record = RecordNode::default();
  let registry = registry().with("record", record.clone());
  let wf = workflow(
    "cancel",
    vec![
      NodeDef::new("a", "block"),
      NodeDef::new("b", "block"),
      NodeDef::new("c", "record"),
      NodeDef::new("d", "record"),
      NodeDef::new("e", "record"),
    ],
    &[("a", "c"), ("b", "d"), ("c", "e"), ("d", "e")],
  );
  let engine = engine(registry, vec![wf]);

  let id = engine.start_execution("cancel", None, json!({})).await.unwrap();
  wait_for_node(&engine, &id, "a", NodeStatus::Running).await.unwrap();
  wait_for_node(&engine, &id, "b", NodeStatus::Running).await.unwrap();

  let cancelled = engine.cancel_execution(&id).await.unwrap();
  assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

  let execution = engine.wait_for_completion(&id).await.unwrap();
  assert_eq!(execution.status, ExecutionStatus::Cancelled);

  let states = engine.get_node_states(&id).await.unwrap();
  for node_id in ["a", "b"] {
    let s = state(&states, node_id);
    assert_eq!(s.status, NodeStatus::Failed);
    assert_eq!(s.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));
  }
  for node_id in ["c", "d", "e"] {
    let s = state(&states, node_id);
    assert_eq!(s.status, NodeStatus::Pending);
    assert!(s.started_at.is_none());
  }
  assert!(record.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
  let wf = workflow("cancel-twice", vec![NodeDef::new("a", "block")], &[]);
  let engine = engine(registry(), vec![wf]);

  let id = engine.start_execution("cancel-twice", None, json!({})).await.unwrap();
  wait_for_node(&engine, &id, "a", NodeStatus::Running).await.unwrap();

  engine.cancel_execution(&id).await.unwrap();
  engine.wait_for_completion(&id).await.unwrap();
  let again = engine.cancel_execution(&id).await.unwrap();
  assert_eq!(again.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_finished_execution_is_rejected() {
  let wf = workflow("done", vec![NodeDef::new("a", "set")], &[]);
  let engine = engine(registry(), vec![wf]);

  let id = engine.start_execution("done", None, json!({})).await.unwrap();
  engine.wait_for_completion(&id).await.unwrap();

  let err = engine.cancel_execution(&id).await.unwrap_err();
  assert!(matches!(
    err,
    EngineError::InvalidState {
      status: ExecutionStatus::Success,
      ..
    }
  ));
  assert_eq!(
    err.to_string(),
    format!("execution '{}' is Success and cannot be cancelled", id)
  );
}

#[tokio::test]
async fn test_unknown_execution() {
  let engine = engine(registry(), vec![]);

  assert!(matches!(
    engine.get_execution_status("missing").await,
    Err(EngineError::ExecutionNotFound { .. })
  ));
  assert!(matches!(
    engine.cancel_execution("missing").await,
    Err(EngineError::ExecutionNotFound { .. })
  ));
  assert!(matches!(
    engine.subscribe("missing").await,
    Err(EngineError::ExecutionNotFound { .. })
  ));
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_dispatch_until_resume() {
  let wf = workflow(
    "pause",
    vec![
      NodeDef::new("a", "sleep").with_config(json!({ "ms": 1000 })),
      NodeDef::new("b", "set").with_config(json!({ "after": "a" })),
    ],
    &[("a", "b")],
  );
  let engine = engine(registry(), vec![wf]);

  let id = engine.start_execution("pause", None, json!({})).await.unwrap();
  wait_for_node(&engine, &id, "a", NodeStatus::Running).await.unwrap();

  let paused = engine.pause_execution(&id).await.unwrap();
  assert_eq!(paused.status, ExecutionStatus::Paused);

  // The running node completes while paused, its successor does not start.
  tokio::time::sleep(Duration::from_secs(5)).await;
  let states = engine.get_node_states(&id).await.unwrap();
  assert_eq!(state(&states, "a").status, NodeStatus::Success);
  assert_eq!(state(&states, "b").status, NodeStatus::Pending);
  assert_eq!(
    engine.get_execution_status(&id).await.unwrap().status,
    ExecutionStatus::Paused
  );

  assert!(matches!(
    engine.pause_execution(&id).await,
    Err(EngineError::InvalidState { .. })
  ));

  let resumed = engine.resume_execution(&id).await.unwrap();
  assert_eq!(resumed.status, ExecutionStatus::Running);

  let execution = engine.wait_for_completion(&id).await.unwrap();
  assert_eq!(execution.status, ExecutionStatus::Success);
  let states = engine.get_node_states(&id).await.unwrap();
  assert_eq!(state(&states, "b").output, Some(json!({ "after": "a" })));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_paused() {
  let wf = workflow(
    "pause-cancel",
    vec![
      NodeDef::new("a", "sleep").with_config(json!({ "ms": 100 })),
      NodeDef::new("b", "set"),
    ],
    &[("a", "b")],
  );
  let engine = engine(registry(), vec![wf]);

  let id = engine.start_execution("pause-cancel", None, json!({})).await.unwrap();
  wait_for_node(&engine, &id, "a", NodeStatus::Running).await.unwrap();
  engine.pause_execution(&id).await.unwrap();
  wait_for_node(&engine, &id, "a", NodeStatus::Success).await.unwrap();

  engine.cancel_execution(&id).await.unwrap();
  let execution = engine.wait_for_completion(&id).await.unwrap();

  assert_eq!(execution.status, ExecutionStatus::Cancelled);
  let states = engine.get_node_states(&id).await.unwrap();
  assert_eq!(state(&states, "b").status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_resume_running_execution_is_rejected() {
  let wf = workflow("resume", vec![NodeDef::new("a", "block")], &[]);
  let engine = engine(registry(), vec![wf]);

  let id = engine.start_execution("resume", None, json!({})).await.unwrap();
  wait_for_node(&engine, &id, "a", NodeStatus::Running).await.unwrap();

  let err = engine.resume_execution(&id).await.unwrap_err();
  assert_eq!(
    err.to_string(),
    format!("execution '{}' is Running and cannot be resumed", id)
  );

  engine.cancel_execution(&id).await.unwrap();
  engine.wait_for_completion(&id).await.unwrap();
}
