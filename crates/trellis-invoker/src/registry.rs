use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use trellis_store::NodeError;

use crate::NodeContext;

/// How the invoker drives an implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
  /// Awaited in place under the deadline.
  #[default]
  Sync,
  /// Spawned as its own task; outlives a timeout and finishes on its own.
  Async,
  /// Like `Async`, and items pushed with [`NodeContext::emit`] are
  /// collected into the output.
  Stream,
}

/// A node type's behaviour.
#[async_trait]
pub trait NodeImplementation: Send + Sync {
  fn mode(&self) -> ExecutionMode {
    ExecutionMode::Sync
  }

  /// Run the node against its resolved input.
  async fn execute(&self, input: serde_json::Value, ctx: &NodeContext) -> Result<serde_json::Value, NodeError>;
}

/// Lookup from node type string to implementation.
pub trait NodeRegistry: Send + Sync {
  fn resolve(&self, node_type: &str) -> Option<Arc<dyn NodeImplementation>>;
}

/// Registry backed by a fixed map, filled at startup.
#[derive(Default, Clone)]
pub struct StaticRegistry {
  nodes: HashMap<String, Arc<dyn NodeImplementation>>,
}

impl StaticRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `implementation` under `node_type`, replacing any previous one.
  pub fn register(&mut self, node_type: impl Into<String>, implementation: impl NodeImplementation + 'static) {
    self.nodes.insert(node_type.into(), Arc::new(implementation));
  }

  /// Builder form of [`StaticRegistry::register`].
  pub fn with(mut self, node_type: impl Into<String>, implementation: impl NodeImplementation + 'static) -> Self {
    self.register(node_type, implementation);
    self
  }

  /// Registered node types, sorted.
  pub fn node_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
    types.sort_unstable();
    types
  }
}

impl NodeRegistry for StaticRegistry {
  fn resolve(&self, node_type: &str) -> Option<Arc<dyn NodeImplementation>> {
    self.nodes.get(node_type).cloned()
  }
}
