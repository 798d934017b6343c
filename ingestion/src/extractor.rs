//! The Extractor (spec §4.3): turns free text into new graph nodes/edges
//! while reusing existing ones, via a scoped Temporary-ID Mapper so the
//! LLM never sees a real id.

use epigraph_core::model::{
    Edge, EdgeType, Node, NodeEmbedding, NodeId, NodeMetadata, NodeType, UserId,
};
use epigraph_core::tempid::TempIdMapper;
use query::{QueryEngine, QueryInput};
use serde::Deserialize;
use slm::clients::{CompletionClient, CompletionError, CompletionMessage, EmbeddingClient, EmbeddingKind};
use std::collections::HashSet;
use std::sync::Arc;
use storage::Repository;
use thiserror::Error;

/// Whether the linked source node is a conversation or a document — only
/// used to shape the prompt; both paths share one algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Conversation,
    Document,
}

impl SourceKind {
    fn label(self) -> &'static str {
        match self {
            SourceKind::Conversation => "conversation",
            SourceKind::Document => "document",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("completion failed: {0}")]
    Completion(#[from] CompletionError),
    #[error("query engine failed: {0}")]
    Query(#[from] query::QueryError),
}

#[derive(Debug, Default, Clone)]
pub struct ExtractionOutcome {
    pub created_nodes: Vec<NodeId>,
    pub reused_nodes: Vec<NodeId>,
    pub created_edges: Vec<query::engine::OneHopEdge>,
    pub skipped_nodes: usize,
    pub skipped_edges: usize,
}

#[derive(Debug, Deserialize)]
struct LlmNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    label: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmEdge {
    #[serde(rename = "sourceId")]
    source_id: String,
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    edge_type: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    nodes: Vec<LlmNode>,
    #[serde(default)]
    edges: Vec<LlmEdge>,
}

pub const EXTRACTION_SCHEMA_NAME: &str = "graph_extraction";
const CANDIDATE_LIMIT: usize = 50;
const CANDIDATE_MIN_SIM: f32 = 0.30;

pub struct Extractor {
    repo: Arc<Repository>,
    query: Arc<QueryEngine>,
    embedder: Arc<dyn EmbeddingClient>,
    completion: Arc<dyn CompletionClient>,
    model_id: String,
}

impl Extractor {
    pub fn new(
        repo: Arc<Repository>,
        query: Arc<QueryEngine>,
        embedder: Arc<dyn EmbeddingClient>,
        completion: Arc<dyn CompletionClient>,
        model_id: impl Into<String>,
    ) -> Self {
        Self { repo, query, embedder, completion, model_id: model_id.into() }
    }

    pub async fn extract(
        &self,
        user: &UserId,
        source_kind: SourceKind,
        linked_node_id: &NodeId,
        content: &str,
        now: i64,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let mut mapper: TempIdMapper<NodeId> = TempIdMapper::new();
        let mut ordinal_by_type: std::collections::HashMap<NodeType, usize> = Default::default();

        // Step 1: gather candidate existing context.
        let similar = self
            .query
            .find_similar_nodes(user, QueryInput::Text(content), CANDIDATE_LIMIT, Some(CANDIDATE_MIN_SIM), &[])
            .await?;
        let one_hop = self.query.find_one_hop_nodes(user, std::slice::from_ref(linked_node_id)).await;

        let mut seen_ids: HashSet<NodeId> = HashSet::new();
        let mut candidate_lines = Vec::new();
        for (node_id, node_type, label, description) in similar
            .into_iter()
            .map(|n| (n.node_id, n.node_type, n.label, n.description))
            .chain(one_hop.into_iter().map(|n| (n.node_id, n.node_type, n.label, n.description)))
        {
            if !seen_ids.insert(node_id.clone()) {
                continue;
            }
            // Step 2: project through the Temporary-ID Mapper.
            let ordinal = ordinal_by_type.entry(node_type).or_insert(0);
            let temp_id = format!("existing_{}_{}", node_type.as_wire().to_lowercase(), ordinal);
            *ordinal += 1;
            if mapper.register(&temp_id, node_id).is_err() {
                continue;
            }
            candidate_lines.push(format!(
                "{temp_id}: {} \"{}\"{}",
                node_type,
                label.as_deref().unwrap_or(""),
                description.as_deref().map(|d| format!(" - {d}")).unwrap_or_default()
            ));
        }

        // Step 3: prompt the LLM.
        let system = format!(
            "You extract a typed knowledge graph from {} text. Node types: {}. Edge types: {}. \
             Reuse an existing entity by its given id instead of creating a duplicate. \
             New nodes must use an id of the form temp_<type>_<n>. \
             Return strict JSON: {{\"nodes\":[{{\"id\",\"type\",\"label\",\"description\"}}],\
             \"edges\":[{{\"sourceId\",\"targetId\",\"type\",\"description\"}}]}}.",
            source_kind.label(),
            NodeType::ALL.iter().map(|t| t.as_wire()).collect::<Vec<_>>().join(", "),
            EdgeType::ALL.iter().map(|t| t.as_wire()).collect::<Vec<_>>().join(", "),
        );
        let user_prompt = format!(
            "Existing entities you may reference:\n{}\n\nText to extract from:\n{}",
            candidate_lines.join("\n"),
            content
        );
        let messages = vec![CompletionMessage::system(system), CompletionMessage::user(user_prompt)];
        let raw = self.completion.complete_json(&messages, EXTRACTION_SCHEMA_NAME).await?;
        let parsed: ExtractionResponse = serde_json::from_value(raw)
            .map_err(|e| ExtractError::Completion(CompletionError::LlmParseError(e.to_string())))?;

        // Step 4: dedupe LLM output.
        let mut dedup_nodes: Vec<LlmNode> = Vec::new();
        let mut seen_node_ids: HashSet<String> = HashSet::new();
        for node in parsed.nodes {
            if seen_node_ids.insert(node.id.clone()) {
                dedup_nodes.push(node);
            }
        }
        let mut dedup_edges: Vec<LlmEdge> = Vec::new();
        let mut seen_edge_keys: HashSet<(String, String, String)> = HashSet::new();
        for edge in parsed.edges {
            let key = (edge.source_id.clone(), edge.target_id.clone(), edge.edge_type.clone());
            if seen_edge_keys.insert(key) {
                dedup_edges.push(edge);
            }
        }

        let mut outcome = ExtractionOutcome::default();

        // Step 5: insert new nodes, register mapping; reuse existing tempIds.
        let mut mentioned_in_edges = Vec::new();
        for llm_node in &dedup_nodes {
            if mapper.contains_temp_id(&llm_node.id) {
                if let Some(existing) = mapper.resolve(&llm_node.id) {
                    outcome.reused_nodes.push(existing.clone());
                }
                continue;
            }
            let Some(node_type) = NodeType::from_wire(&llm_node.node_type) else {
                tracing::warn!(node_type = %llm_node.node_type, "skipping node with unknown type");
                outcome.skipped_nodes += 1;
                continue;
            };
            let node = Node::new(user.clone(), node_type, now);
            let mut metadata = NodeMetadata::new(node.id.clone()).with_label(llm_node.label.clone());
            if let Some(desc) = &llm_node.description {
                metadata = metadata.with_description(desc.clone());
            }
            let node_id = node.id.clone();
            match self.repo.insert_node_with_metadata(node, metadata).await {
                Ok(_) => {
                    if mapper.register(&llm_node.id, node_id.clone()).is_err() {
                        tracing::warn!(temp_id = %llm_node.id, "duplicate tempId from LLM output");
                        outcome.skipped_nodes += 1;
                        continue;
                    }
                    outcome.created_nodes.push(node_id.clone());
                    // Step 6: every newly created node is MENTIONED_IN the linked source node.
                    if let Ok(edge) = Edge::new(
                        user.clone(),
                        node_id,
                        linked_node_id.clone(),
                        EdgeType::MentionedIn,
                        now,
                    ) {
                        mentioned_in_edges.push(edge);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to insert extracted node, skipping");
                    outcome.skipped_nodes += 1;
                }
            }
        }
        if !mentioned_in_edges.is_empty() {
            self.repo.insert_edges(mentioned_in_edges).await.map_err(|e| {
                tracing::warn!(error = %e, "failed to insert MENTIONED_IN edges");
                e
            }).ok();
        }

        // Step 7: translate LLM edges through the map, drop unresolved references.
        let mut edges_to_insert = Vec::new();
        for llm_edge in &dedup_edges {
            let Some(edge_type) = EdgeType::from_wire(&llm_edge.edge_type) else {
                tracing::warn!(edge_type = %llm_edge.edge_type, "skipping edge with unknown type");
                outcome.skipped_edges += 1;
                continue;
            };
            let (Some(src), Some(tgt)) =
                (mapper.resolve(&llm_edge.source_id), mapper.resolve(&llm_edge.target_id))
            else {
                tracing::warn!(
                    source = %llm_edge.source_id,
                    target = %llm_edge.target_id,
                    "dropping edge referencing unknown tempId"
                );
                outcome.skipped_edges += 1;
                continue;
            };
            match Edge::new(user.clone(), src.clone(), tgt.clone(), edge_type, now) {
                Ok(mut edge) => {
                    edge.description = llm_edge.description.clone();
                    edges_to_insert.push(edge);
                }
                Err(_) => {
                    outcome.skipped_edges += 1;
                }
            }
        }
        let inserted_edges = self.repo.insert_edges(edges_to_insert).await?;

        // Step 8: embeddings for newly created nodes and newly inserted edges with a description.
        for node_id in &outcome.created_nodes {
            let Some(metadata) = self.repo.get_node_metadata(node_id).await else { continue };
            let Some(label) = &metadata.label else { continue };
            let text = format!("{label}: {}", metadata.description.as_deref().unwrap_or(""));
            if let Ok(vector) = self.embedder.embed_one(&text, EmbeddingKind::Passage).await {
                if let Ok(embedding) = NodeEmbedding::new(node_id.clone(), vector, self.model_id.clone()) {
                    let _ = self.repo.insert_node_embedding(embedding).await;
                }
            }
        }
        for edge in &inserted_edges {
            let Some(description) = &edge.description else { continue };
            let src_label = self.repo.get_node_metadata(&edge.source_node_id).await.and_then(|m| m.label);
            let tgt_label = self.repo.get_node_metadata(&edge.target_node_id).await.and_then(|m| m.label);
            let text = format!(
                "{} {} {}: {description}",
                src_label.as_deref().unwrap_or("unknown"),
                edge.edge_type,
                tgt_label.as_deref().unwrap_or("unknown"),
            );
            if let Ok(vector) = self.embedder.embed_one(&text, EmbeddingKind::Passage).await {
                if let Ok(embedding) =
                    epigraph_core::model::EdgeEmbedding::new(edge.id.clone(), vector, self.model_id.clone())
                {
                    let _ = self.repo.insert_edge_embedding(embedding).await;
                }
            }
            outcome.created_edges.push(query::engine::OneHopEdge {
                source_node_id: edge.source_node_id.clone(),
                target_node_id: edge.target_node_id.clone(),
                edge_type: edge.edge_type,
                source_label: src_label,
                target_label: tgt_label,
            });
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slm::clients::{DeterministicEmbeddingClient, HeuristicRerankClient, ScriptedCompletionClient};
    use storage::wal::Wal;
    use tokio::sync::Mutex;

    async fn harness() -> (Extractor, Arc<Repository>, Arc<ScriptedCompletionClient>, UserId) {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).await.unwrap();
        let repo = Arc::new(Repository::new(Arc::new(Mutex::new(wal))));
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(DeterministicEmbeddingClient::new("embedding-default-v1"));
        let completion = Arc::new(ScriptedCompletionClient::new());
        let query_engine = Arc::new(QueryEngine::new(repo.clone(), embedder.clone(), Arc::new(HeuristicRerankClient)));
        let extractor = Extractor::new(
            repo.clone(),
            query_engine,
            embedder,
            completion.clone(),
            "extraction-model-v1",
        );
        let user = UserId::new("u1");
        repo.ensure_user(&user).await.unwrap();
        (extractor, repo, completion, user)
    }

    #[tokio::test]
    async fn extracts_new_nodes_and_links_them_to_the_source() {
        let (extractor, repo, completion, user) = harness().await;
        let doc_node = Node::new(user.clone(), NodeType::Document, 0);
        let doc_id = doc_node.id.clone();
        repo.insert_node_with_metadata(doc_node, NodeMetadata::new(doc_id.clone())).await.unwrap();

        completion.push_response(
            EXTRACTION_SCHEMA_NAME,
            serde_json::json!({
                "nodes": [
                    {"id": "temp_person_0", "type": "Person", "label": "Alice", "description": "met Bob"},
                    {"id": "temp_person_1", "type": "Person", "label": "Bob", "description": null}
                ],
                "edges": [
                    {"sourceId": "temp_person_0", "targetId": "temp_person_1", "type": "RELATED_TO", "description": "met in Paris"}
                ]
            }),
        );

        let outcome = extractor
            .extract(&user, SourceKind::Document, &doc_id, "Alice met Bob in Paris.", 1000)
            .await
            .unwrap();

        assert_eq!(outcome.created_nodes.len(), 2);
        assert_eq!(outcome.created_edges.len(), 1);
        assert_eq!(outcome.skipped_nodes, 0);
        assert_eq!(outcome.skipped_edges, 0);

        for node_id in &outcome.created_nodes {
            assert!(repo.has_node_embedding(node_id).await);
        }

        let hop = repo.one_hop(&doc_id).await;
        assert_eq!(hop.len(), 2, "both new nodes must be MENTIONED_IN the document");
    }

    #[tokio::test]
    async fn drops_edges_referencing_unknown_temp_ids() {
        let (extractor, repo, completion, user) = harness().await;
        let doc_node = Node::new(user.clone(), NodeType::Document, 0);
        let doc_id = doc_node.id.clone();
        repo.insert_node_with_metadata(doc_node, NodeMetadata::new(doc_id.clone())).await.unwrap();

        completion.push_response(
            EXTRACTION_SCHEMA_NAME,
            serde_json::json!({
                "nodes": [{"id": "temp_person_0", "type": "Person", "label": "Alice", "description": null}],
                "edges": [{"sourceId": "temp_person_0", "targetId": "temp_person_99", "type": "RELATED_TO", "description": null}]
            }),
        );

        let outcome = extractor
            .extract(&user, SourceKind::Document, &doc_id, "Alice.", 1000)
            .await
            .unwrap();

        assert_eq!(outcome.created_nodes.len(), 1);
        assert_eq!(outcome.created_edges.len(), 0);
        assert_eq!(outcome.skipped_edges, 1);
    }

    #[tokio::test]
    async fn reuses_existing_nodes_instead_of_duplicating() {
        let (extractor, repo, completion, user) = harness().await;
        let doc_node = Node::new(user.clone(), NodeType::Document, 0);
        let doc_id = doc_node.id.clone();
        repo.insert_node_with_metadata(doc_node, NodeMetadata::new(doc_id.clone())).await.unwrap();

        let alice = Node::new(user.clone(), NodeType::Person, 0);
        let alice_id = alice.id.clone();
        repo.insert_node_with_metadata(alice, NodeMetadata::new(alice_id.clone()).with_label("Alice"))
            .await
            .unwrap();
        // One-hop-reachable from the linked source node, so the candidate
        // projection step picks her up regardless of vector similarity.
        let link_edge =
            Edge::new(user.clone(), alice_id.clone(), doc_id.clone(), EdgeType::MentionedIn, 0).unwrap();
        repo.insert_edges(vec![link_edge]).await.unwrap();

        completion.push_response(
            EXTRACTION_SCHEMA_NAME,
            serde_json::json!({
                "nodes": [{"id": "existing_person_0", "type": "Person", "label": "Alice", "description": null}],
                "edges": []
            }),
        );

        let outcome = extractor
            .extract(&user, SourceKind::Document, &doc_id, "Alice again.", 1000)
            .await
            .unwrap();

        assert_eq!(outcome.created_nodes.len(), 0, "existing tempId must not create a duplicate node");
    }
}
