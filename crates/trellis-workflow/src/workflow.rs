use std::collections::HashMap;

use trellis_config::{ConnectionDef, WorkflowDef, WorkflowSettings};

use crate::error::WorkflowError;
use crate::graph::Graph;
use crate::node::Node;

/// A validated workflow version ready for execution.
#[derive(Debug, Clone)]
pub struct Workflow {
  pub workflow_id: String,
  pub version: u32,
  pub name: String,
  pub variables: serde_json::Map<String, serde_json::Value>,
  pub settings: WorkflowSettings,
  /// Nodes in definition order.
  pub nodes: Vec<Node>,
  pub connections: Vec<ConnectionDef>,
  index: HashMap<String, usize>,
  graph: Graph,
}

impl Workflow {
  /// Validate a definition and resolve node policies.
  pub fn from_def(def: WorkflowDef) -> Result<Self, WorkflowError> {
    if def.nodes.is_empty() {
      return Err(WorkflowError::Empty);
    }

    let mut index = HashMap::with_capacity(def.nodes.len());
    for (i, node) in def.nodes.iter().enumerate() {
      if index.insert(node.node_id.clone(), i).is_some() {
        return Err(WorkflowError::DuplicateNode(node.node_id.clone()));
      }
    }

    for conn in &def.connections {
      if !index.contains_key(&conn.source) || !index.contains_key(&conn.target) {
        return Err(WorkflowError::InvalidConnection {
          from: conn.source.clone(),
          to: conn.target.clone(),
        });
      }
      if conn.source == conn.target {
        return Err(WorkflowError::SelfLoop(conn.source.clone()));
      }
    }

    let node_ids: Vec<String> = def.nodes.iter().map(|n| n.node_id.clone()).collect();
    let graph = Graph::new(&node_ids, &def.connections);
    graph
      .topological_order()
      .map_err(|nodes| WorkflowError::Cycle { nodes })?;

    let settings = def.settings;
    let nodes = def
      .nodes
      .into_iter()
      .map(|n| Node::resolve(n, &settings))
      .collect();

    Ok(Self {
      workflow_id: def.workflow_id,
      version: def.version,
      name: def.name,
      variables: def.variables,
      settings,
      nodes,
      connections: def.connections,
      index,
      graph,
    })
  }

  /// Parse and validate a JSON definition.
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    let def: WorkflowDef = serde_json::from_str(json)?;
    Self::from_def(def).map_err(serde::de::Error::custom)
  }

  /// The graph structure for traversal.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Get a node by ID.
  pub fn get_node(&self, node_id: &str) -> Option<&Node> {
    self.index.get(node_id).map(|i| &self.nodes[*i])
  }

  /// Get a node by ID, failing if it does not exist.
  pub fn node(&self, node_id: &str) -> Result<&Node, WorkflowError> {
    self
      .get_node(node_id)
      .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
  }
}
