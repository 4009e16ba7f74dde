use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use trellis_workflow::Workflow;

use crate::EngineError;

/// Where validated workflow versions come from.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
  /// Load a workflow version, or the latest when `version` is `None`.
  async fn load(&self, workflow_id: &str, version: Option<u32>) -> Result<Arc<Workflow>, EngineError>;
}

/// Workflows held in memory, keyed by id and version.
#[derive(Default)]
pub struct InMemoryWorkflows {
  workflows: RwLock<HashMap<String, BTreeMap<u32, Arc<Workflow>>>>,
}

impl InMemoryWorkflows {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add or replace a workflow version.
  pub fn insert(&self, workflow: Workflow) {
    let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
    workflows
      .entry(workflow.workflow_id.clone())
      .or_default()
      .insert(workflow.version, Arc::new(workflow));
  }
}

#[async_trait]
impl WorkflowSource for InMemoryWorkflows {
  async fn load(&self, workflow_id: &str, version: Option<u32>) -> Result<Arc<Workflow>, EngineError> {
    let workflows = self.workflows.read().unwrap_or_else(PoisonError::into_inner);
    let versions = workflows.get(workflow_id);
    let workflow = match version {
      Some(v) => versions.and_then(|vs| vs.get(&v)),
      None => versions.and_then(|vs| vs.values().next_back()),
    };
    workflow.cloned().ok_or_else(|| EngineError::WorkflowNotFound {
      workflow_id: workflow_id.to_string(),
      version,
    })
  }
}
