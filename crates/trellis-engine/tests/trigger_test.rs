//! Trigger firings turned into executions.

mod common;

use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use trellis_config::{NodeDef, TriggerKind};
use trellis_engine::{TriggerFiring, TriggerRunner};
use trellis_store::ExecutionStatus;

#[tokio::test]
async fn test_runner_starts_one_execution_per_firing() {
  let wf = workflow(
    "hook",
    vec![NodeDef::new("a", "set").with_config(json!({ "body": "{{ trigger.body }}" }))],
    &[],
  );
  let engine = engine(registry(), vec![wf]);
  let runner = TriggerRunner::with_buffer_size(engine.clone(), 4);
  let sender = runner.sender();

  sender
    .send(TriggerFiring::manual("hook", json!({ "body": 1 })).with_kind(TriggerKind::Webhook))
    .await
    .unwrap();
  sender
    .send(TriggerFiring::manual("missing", json!({})))
    .await
    .unwrap();
  sender
    .send(TriggerFiring::manual("hook", json!({ "body": 2 })).with_kind(TriggerKind::Schedule))
    .await
    .unwrap();
  drop(sender);

  // The channel closes once every sender is gone.
  let started = runner.start(CancellationToken::new()).await;
  assert_eq!(started, 2);

  let mut runs = Vec::new();
  for execution in engine.list_executions("hook").await.unwrap() {
    let execution = engine.wait_for_completion(&execution.execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    let states = engine.get_node_states(&execution.execution_id).await.unwrap();
    let body = state(&states, "a").output.clone();
    runs.push((execution.trigger_payload["body"].as_i64(), execution.trigger_kind, body));
  }
  runs.sort_by_key(|(body, _, _)| *body);
  assert_eq!(
    runs,
    vec![
      (Some(1), TriggerKind::Webhook, Some(json!({ "body": 1 }))),
      (Some(2), TriggerKind::Schedule, Some(json!({ "body": 2 }))),
    ]
  );
}
