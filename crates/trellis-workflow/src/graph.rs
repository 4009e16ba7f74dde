use std::collections::{HashMap, HashSet, VecDeque};

use trellis_config::ConnectionDef;

/// Graph structure for traversal and analysis.
///
/// Node ids are kept in definition order so that every traversal is
/// deterministic.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Node ids in definition order.
  order: Vec<String>,
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Nodes with no incoming edges.
  entry_points: Vec<String>,
  /// Nodes with multiple upstream nodes (join points).
  join_points: HashSet<String>,
}

impl Graph {
  /// Build a graph from node ids and connections.
  ///
  /// Connections must reference known node ids; parallel connections between
  /// the same pair of nodes (different handles) collapse into one edge.
  pub fn new(node_ids: &[String], connections: &[ConnectionDef]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for node_id in node_ids {
      adjacency.entry(node_id.clone()).or_default();
      reverse_adjacency.entry(node_id.clone()).or_default();
    }

    for conn in connections {
      let downstream = adjacency.entry(conn.source.clone()).or_default();
      if !downstream.contains(&conn.target) {
        downstream.push(conn.target.clone());
      }
      let upstream = reverse_adjacency.entry(conn.target.clone()).or_default();
      if !upstream.contains(&conn.source) {
        upstream.push(conn.source.clone());
      }
    }

    let entry_points: Vec<String> = node_ids
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    let join_points: HashSet<String> = reverse_adjacency
      .iter()
      .filter(|(_, incoming)| incoming.len() > 1)
      .map(|(id, _)| id.clone())
      .collect();

    Self {
      order: node_ids.to_vec(),
      adjacency,
      reverse_adjacency,
      entry_points,
      join_points,
    }
  }

  /// Node ids in definition order.
  pub fn node_ids(&self) -> &[String] {
    &self.order
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Check if a node is a join point (has multiple upstream nodes).
  pub fn is_join_point(&self, node_id: &str) -> bool {
    self.join_points.contains(node_id)
  }

  /// Get all join points.
  pub fn join_points(&self) -> &HashSet<String> {
    &self.join_points
  }

  /// Topological order (Kahn), ties broken by definition order.
  ///
  /// On failure returns the nodes that lie on a cycle.
  pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();

    let mut queue: VecDeque<&str> = self
      .order
      .iter()
      .filter(|id| in_degree[id.as_str()] == 0)
      .map(|id| id.as_str())
      .collect();

    let mut sorted = Vec::with_capacity(self.order.len());
    while let Some(id) = queue.pop_front() {
      sorted.push(id.to_string());
      for next in self.downstream(id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(next.as_str());
          }
        }
      }
    }

    if sorted.len() == self.order.len() {
      return Ok(sorted);
    }

    // Whatever Kahn could not drain is on a cycle or downstream of one. Peel
    // off the downstream part by repeatedly removing nodes with no outgoing
    // edge back into the remainder.
    let mut remaining: HashSet<&str> = in_degree
      .iter()
      .filter(|(_, degree)| **degree > 0)
      .map(|(id, _)| *id)
      .collect();
    loop {
      let sinks: Vec<&str> = remaining
        .iter()
        .filter(|id| {
          !self
            .downstream(id)
            .iter()
            .any(|next| remaining.contains(next.as_str()))
        })
        .copied()
        .collect();
      if sinks.is_empty() {
        break;
      }
      for sink in sinks {
        remaining.remove(sink);
      }
    }

    Err(
      self
        .order
        .iter()
        .filter(|id| remaining.contains(id.as_str()))
        .cloned()
        .collect(),
    )
  }

  /// All nodes reachable from `node_id`, excluding itself.
  pub fn descendants(&self, node_id: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
    while let Some(current) = queue.pop_front() {
      for next in self.downstream(current) {
        if seen.insert(next.clone()) {
          queue.push_back(next);
        }
      }
    }
    seen.remove(node_id);
    seen
  }
}
