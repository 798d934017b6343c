use crate::index::{AdjacencyGraph, LinearAnnIndex};
use epigraph_core::model::{EdgeType, NodeId};
use std::collections::HashMap;

/// HyperIndex combines the vector and graph indexes with an alias map,
/// the in-memory structure the retrieval engine reads against.
pub struct HyperIndex {
    pub vector_index: LinearAnnIndex,
    pub graph_index: AdjacencyGraph,
    // Alias text -> canonical node id, for entity resolution.
    id_aliases: HashMap<String, NodeId>,
}

impl HyperIndex {
    pub fn new() -> Self {
        Self {
            vector_index: LinearAnnIndex::new(),
            graph_index: AdjacencyGraph::new(),
            id_aliases: HashMap::new(),
        }
    }

    pub fn insert_node(&mut self, id: NodeId, embedding: Vec<f32>) {
        if !embedding.is_empty() {
            self.vector_index.insert(id, embedding);
        }
    }

    pub fn insert_edge(&mut self, source: NodeId, target: NodeId, relation: EdgeType, weight: f32) {
        self.graph_index.add_edge(source, target, relation, weight);
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        self.vector_index.delete(id);
        self.graph_index.remove_node(id);
        self.id_aliases.retain(|_, v| v != id);
    }

    /// Register an alias (e.g., entity name) for an ID
    pub fn register_alias(&mut self, alias: impl Into<String>, id: NodeId) {
        self.id_aliases.insert(alias.into(), id);
    }

    /// Resolve an alias to an ID
    pub fn resolve_alias(&self, alias: &str) -> Option<NodeId> {
        self.id_aliases.get(alias).cloned()
    }

    /// Vector search: find top-k similar nodes
    pub fn search_vector(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        self.vector_index.search(query, k)
    }

    /// Graph expansion: get neighbors up to max_hops
    pub fn expand_graph(&self, id: &NodeId, max_hops: u8) -> Vec<(NodeId, u8)> {
        self.graph_index.expand(id, max_hops)
    }
}

impl Default for HyperIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyper_index_vector_graph() {
        let mut index = HyperIndex::new();
        let (n1, n2) = (NodeId::node(), NodeId::node());

        index.insert_node(n1.clone(), vec![1.0, 0.0]);
        index.insert_node(n2.clone(), vec![0.0, 1.0]);
        index.insert_edge(n1.clone(), n2.clone(), EdgeType::RelatedTo, 1.0);

        let results = index.search_vector(&[1.0, 0.0], 1);
        assert_eq!(results[0].0, n1);

        let neighbors = index.expand_graph(&n1, 1);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, n2);
    }

    #[test]
    fn test_hyper_index_alias() {
        let mut index = HyperIndex::new();
        let n1 = NodeId::node();
        index.insert_node(n1.clone(), vec![1.0]);
        index.register_alias("Alice", n1.clone());

        assert_eq!(index.resolve_alias("Alice"), Some(n1));
        assert_eq!(index.resolve_alias("Bob"), None);
    }
}
