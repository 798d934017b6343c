use epigraph_core::model::{EdgeType, NodeId};
use std::collections::{HashMap, VecDeque};

/// Edge representation: (target_id, relation, weight)
pub type EdgeData = (NodeId, EdgeType, f32);

/// Simple adjacency list graph index
#[derive(Clone, Debug, Default)]
pub struct AdjacencyGraph {
    adjacency: HashMap<NodeId, Vec<EdgeData>>,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self {
            adjacency: HashMap::new(),
        }
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, relation: EdgeType, weight: f32) {
        self.adjacency
            .entry(source)
            .or_default()
            .push((target, relation, weight));
    }

    pub fn remove_edge(&mut self, source: &NodeId, target: &NodeId) -> bool {
        if let Some(edges) = self.adjacency.get_mut(source) {
            let len_before = edges.len();
            edges.retain(|(t, _, _)| t != target);
            return edges.len() < len_before;
        }
        false
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        // Remove outgoing edges
        self.adjacency.remove(id);
        // Remove incoming edges
        for edges in self.adjacency.values_mut() {
            edges.retain(|(t, _, _)| t != id);
        }
    }

    /// Get 1-hop neighbors
    pub fn neighbors(&self, id: &NodeId) -> Vec<&EdgeData> {
        self.adjacency
            .get(id)
            .map(|edges| edges.iter().collect())
            .unwrap_or_default()
    }

    /// Get neighbors within max_hops (BFS). Returns (node_id, distance) pairs,
    /// excluding the start node.
    pub fn expand(&self, start_id: &NodeId, max_hops: u8) -> Vec<(NodeId, u8)> {
        if max_hops == 0 {
            return vec![];
        }

        let mut visited: HashMap<NodeId, u8> = HashMap::new();
        let mut queue = VecDeque::new();

        visited.insert(start_id.clone(), 0);
        queue.push_back((start_id.clone(), 0u8));

        let mut result = Vec::new();

        while let Some((curr_id, dist)) = queue.pop_front() {
            if dist >= max_hops {
                continue;
            }

            if let Some(edges) = self.adjacency.get(&curr_id) {
                for (target, _, _) in edges {
                    if !visited.contains_key(target) {
                        visited.insert(target.clone(), dist + 1);
                        result.push((target.clone(), dist + 1));
                        queue.push_back((target.clone(), dist + 1));
                    }
                }
            }
        }

        result
    }

    /// One-hop neighbors (node ids only, deduplicated).
    pub fn one_hop_node_ids(&self, id: &NodeId) -> Vec<NodeId> {
        self.expand(id, 1).into_iter().map(|(n, _)| n).collect()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|v| v.len()).sum()
    }

    pub fn edges(&self) -> Vec<(NodeId, NodeId, f32)> {
        let mut out = Vec::new();
        for (source, edges) in &self.adjacency {
            for (target, _relation, weight) in edges {
                out.push((source.clone(), target.clone(), *weight));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        out
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut nodes = std::collections::BTreeSet::new();
        for (source, edges) in &self.adjacency {
            nodes.insert(source.clone());
            for (target, _, _) in edges {
                nodes.insert(target.clone());
            }
        }
        nodes.into_iter().collect()
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        if self.adjacency.contains_key(id) {
            return true;
        }
        self.adjacency
            .values()
            .any(|edges| edges.iter().any(|(target, _, _)| target == id))
    }

    pub fn node_count(&self) -> usize {
        self.node_ids().len()
    }

    /// Outgoing edge count per node, used by the cleanup engine to pick
    /// entry nodes for a subgraph traversal.
    pub fn out_degree(&self, id: &NodeId) -> usize {
        self.adjacency.get(id).map(|e| e.len()).unwrap_or(0)
    }
}
