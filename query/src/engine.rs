use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use epigraph_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use epigraph_core::error::{ErrorCode, MemoryError};
use epigraph_core::kv::KeyValueCache;
use epigraph_core::model::{EdgeId, EdgeType, NodeId, NodeType, UserId};
use epigraph_core::typeid::{TypeId, PREFIX_EDGE, PREFIX_NODE};
use serde::Deserialize;
use slm::clients::{EmbeddingClient, EmbeddingKind, RerankClient};
use storage::Repository;
use thiserror::Error;

/// Default minimum similarity for a plain user query.
pub const MIN_SIM_USER_QUERY: f32 = 0.40;
/// Default minimum similarity for deep-research tangential expansion.
pub const MIN_SIM_DEEP_RESEARCH: f32 = 0.35;
/// Default minimum similarity for cleanup's neighbor expansion.
pub const MIN_SIM_CLEANUP: f32 = 0.50;

/// Neighbors capped regardless of fan-out, per `FindOneHopNodes`.
const ONE_HOP_CAP: usize = 50;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to embed query text: {0}")]
    Embedding(String),
    #[error("failed to rerank search results: {0}")]
    Rerank(String),
}

impl MemoryError for QueryError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Internal
    }
}

/// A query either carries raw text (to be embedded) or an already-computed
/// embedding (e.g. reusing a vector computed earlier in the same job).
pub enum QueryInput<'a> {
    Text(&'a str),
    Embedding(Vec<f32>),
}

#[derive(Debug, Clone)]
pub struct SimilarNode {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub label: Option<String>,
    pub description: Option<String>,
    pub created_at: i64,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct SimilarEdge {
    pub edge_id: EdgeId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub source_label: Option<String>,
    pub target_label: Option<String>,
    pub edge_type: EdgeType,
    pub description: Option<String>,
    pub similarity: f32,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct OneHopEdge {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub edge_type: EdgeType,
    pub source_label: Option<String>,
    pub target_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OneHopNode {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub label: Option<String>,
    pub description: Option<String>,
    pub created_at: i64,
    pub edge: OneHopEdge,
}

#[derive(Debug, Clone)]
pub struct RankedItem {
    pub text: String,
    pub relevance_score: f32,
    pub node_id: Option<NodeId>,
    pub edge_id: Option<EdgeId>,
}

#[derive(Debug, Clone, Default)]
pub struct HybridSearchResult {
    pub similar_nodes: Vec<RankedItem>,
    pub similar_edges: Vec<RankedItem>,
    pub connections: Vec<RankedItem>,
}

impl HybridSearchResult {
    /// Formats the three reranked groups as one ordered document for the
    /// completion prompt.
    pub fn format_for_llm(&self) -> String {
        let mut out = String::new();
        for (heading, items) in [
            ("Similar entities", &self.similar_nodes),
            ("Similar relationships", &self.similar_edges),
            ("Connections", &self.connections),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str(heading);
            out.push_str(":\n");
            for item in items {
                out.push_str("- ");
                out.push_str(&item.text);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

/// Either a `NodeId` or an `EdgeId` — both are `TypeId` under the hood, so
/// the rerank step stays generic over node/edge groups without duplicating
/// its loop.
enum IdSlot {
    Node(NodeId),
    Edge(EdgeId),
}

impl IdSlot {
    fn as_node_id(&self) -> Option<NodeId> {
        match self {
            IdSlot::Node(id) => Some(id.clone()),
            IdSlot::Edge(_) => None,
        }
    }

    fn as_edge_id(&self) -> Option<EdgeId> {
        match self {
            IdSlot::Edge(id) => Some(id.clone()),
            IdSlot::Node(_) => None,
        }
    }
}

impl From<NodeId> for IdSlot {
    fn from(id: NodeId) -> Self {
        IdSlot::Node(id)
    }
}

impl From<EdgeId> for IdSlot {
    fn from(id: EdgeId) -> Self {
        IdSlot::Edge(id)
    }
}

pub struct QueryEngine {
    repo: Arc<Repository>,
    embedder: Arc<dyn EmbeddingClient>,
    reranker: Arc<dyn RerankClient>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    deep_research_cache: Option<Arc<dyn KeyValueCache>>,
}

impl QueryEngine {
    pub fn new(
        repo: Arc<Repository>,
        embedder: Arc<dyn EmbeddingClient>,
        reranker: Arc<dyn RerankClient>,
    ) -> Self {
        Self { repo, embedder, reranker, audit_sink: None, deep_research_cache: None }
    }

    /// Wires in the deep-research result cache (§4.8) so `hybrid_search`
    /// can merge a conversation's cached findings into the live result
    /// before reranking.
    pub fn with_deep_research_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.deep_research_cache = Some(cache);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    async fn resolve_vector(&self, input: &QueryInput<'_>) -> Result<Vec<f32>, QueryError> {
        match input {
            QueryInput::Embedding(v) => Ok(v.clone()),
            QueryInput::Text(text) => self
                .embedder
                .embed_one(text, EmbeddingKind::Query)
                .await
                .map_err(|e| QueryError::Embedding(e.to_string())),
        }
    }

    /// `FindSimilarNodes(user, text|embedding, limit, minSim?, excludeTypes?)`.
    pub async fn find_similar_nodes(
        &self,
        user: &UserId,
        input: QueryInput<'_>,
        limit: usize,
        min_sim: Option<f32>,
        exclude_types: &[NodeType],
    ) -> Result<Vec<SimilarNode>, QueryError> {
        let min_sim = min_sim.unwrap_or(MIN_SIM_USER_QUERY);
        let vector = self.resolve_vector(&input).await?;
        let over_fetch = limit.saturating_mul(3).max(limit) + 20;
        let hits = self.repo.search_node_vectors(user, &vector, over_fetch, exclude_types).await;

        let mut results = Vec::with_capacity(hits.len());
        for (node_id, similarity) in hits {
            if similarity < min_sim {
                continue;
            }
            let Some(node) = self.repo.get_node(&node_id).await else { continue };
            let metadata = self.repo.get_node_metadata(&node_id).await;
            results.push(SimilarNode {
                node_id,
                node_type: node.node_type,
                label: metadata.as_ref().and_then(|m| m.label.clone()),
                description: metadata.and_then(|m| m.description),
                created_at: node.created_at,
                similarity,
            });
        }
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        results.truncate(limit);
        Ok(results)
    }

    /// `FindSimilarEdges(user, text|embedding, limit, minSim?)`.
    pub async fn find_similar_edges(
        &self,
        user: &UserId,
        input: QueryInput<'_>,
        limit: usize,
        min_sim: Option<f32>,
    ) -> Result<Vec<SimilarEdge>, QueryError> {
        let min_sim = min_sim.unwrap_or(MIN_SIM_USER_QUERY);
        let vector = self.resolve_vector(&input).await?;
        let over_fetch = limit.saturating_mul(3).max(limit) + 20;
        let hits = self.repo.search_edge_vectors(user, &vector, over_fetch).await;

        let mut results = Vec::with_capacity(hits.len());
        for (edge_id, similarity) in hits {
            if similarity < min_sim {
                continue;
            }
            let Some(edge) = self.repo.get_edge(&edge_id).await else { continue };
            let source_label = self.label_for(&edge.source_node_id).await;
            let target_label = self.label_for(&edge.target_node_id).await;
            results.push(SimilarEdge {
                edge_id,
                source_node_id: edge.source_node_id,
                target_node_id: edge.target_node_id,
                source_label,
                target_label,
                edge_type: edge.edge_type,
                description: edge.description,
                similarity,
                created_at: edge.created_at,
            });
        }
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.edge_id.cmp(&b.edge_id))
        });
        results.truncate(limit);
        Ok(results)
    }

    async fn label_for(&self, node_id: &NodeId) -> Option<String> {
        self.repo.get_node_metadata(node_id).await.and_then(|m| m.label)
    }

    /// `FindOneHopNodes(user, seedIds[])`. Never returns a seed, dedupes
    /// on `nodeId`, caps at 50, and prefers labeled nodes when truncating.
    pub async fn find_one_hop_nodes(&self, user: &UserId, seed_ids: &[NodeId]) -> Vec<OneHopNode> {
        let seed_set: HashSet<&NodeId> = seed_ids.iter().collect();
        let mut by_node: HashMap<NodeId, OneHopNode> = HashMap::new();

        for seed in seed_ids {
            for neighbor in self.repo.one_hop(seed).await {
                if seed_set.contains(&neighbor.node_id) || by_node.contains_key(&neighbor.node_id) {
                    continue;
                }
                let Some(node) = self.repo.get_node(&neighbor.node_id).await else { continue };
                if &node.user_id != user {
                    continue;
                }
                let metadata = self.repo.get_node_metadata(&neighbor.node_id).await;
                let source_label = self.label_for(&neighbor.source_node_id).await;
                let target_label = self.label_for(&neighbor.target_node_id).await;
                by_node.insert(
                    neighbor.node_id.clone(),
                    OneHopNode {
                        node_id: neighbor.node_id,
                        node_type: node.node_type,
                        label: metadata.as_ref().and_then(|m| m.label.clone()),
                        description: metadata.and_then(|m| m.description),
                        created_at: node.created_at,
                        edge: OneHopEdge {
                            source_node_id: neighbor.source_node_id,
                            target_node_id: neighbor.target_node_id,
                            edge_type: neighbor.edge_type,
                            source_label,
                            target_label,
                        },
                    },
                );
            }
        }

        let mut results: Vec<OneHopNode> = by_node.into_values().collect();
        results.sort_by(|a, b| {
            let a_labeled = a.label.is_some();
            let b_labeled = b.label.is_some();
            b_labeled.cmp(&a_labeled).then_with(|| a.node_id.cmp(&b.node_id))
        });
        results.truncate(ONE_HOP_CAP);
        results
    }

    /// `FindDayNode(user, YYYY-MM-DD)`.
    pub async fn find_day_node(&self, user: &UserId, date: NaiveDate) -> Option<NodeId> {
        self.repo.find_day_node(user, date).await
    }

    /// The chat tool's hybrid search contract: one query embedding, a
    /// parallel node/edge ANN search, one-hop expansion over the union of
    /// endpoint ids, then a three-group cross-encoder rerank cut to
    /// `limit` per group. When `conversation_id` is given and a
    /// deep-research cache is wired in, that conversation's cached
    /// findings (§4.8) are merged into the node/edge candidate pools
    /// before reranking runs.
    pub async fn hybrid_search(
        &self,
        user: &UserId,
        query_text: &str,
        limit: usize,
        conversation_id: Option<&str>,
    ) -> Result<HybridSearchResult, QueryError> {
        let vector = self
            .embedder
            .embed_one(query_text, EmbeddingKind::Query)
            .await
            .map_err(|e| QueryError::Embedding(e.to_string()))?;

        let node_hits = self
            .find_similar_nodes(user, QueryInput::Embedding(vector.clone()), limit, None, &[])
            .await?;
        let edge_hits = self
            .find_similar_edges(user, QueryInput::Embedding(vector), limit, None)
            .await?;

        let mut endpoint_ids: Vec<NodeId> = node_hits.iter().map(|n| n.node_id.clone()).collect();
        for edge in &edge_hits {
            endpoint_ids.push(edge.source_node_id.clone());
            endpoint_ids.push(edge.target_node_id.clone());
        }
        endpoint_ids.sort();
        endpoint_ids.dedup();

        let connections = self.find_one_hop_nodes(user, &endpoint_ids).await;

        let mut node_texts: Vec<String> = node_hits
            .iter()
            .map(|n| format!("{}: {}", label_or_unknown(&n.label), n.description.as_deref().unwrap_or("")))
            .collect();
        let mut edge_texts: Vec<String> = edge_hits.iter().map(format_edge_text).collect();
        let connection_texts: Vec<String> = connections
            .iter()
            .map(|c| format!("{}: {}", label_or_unknown(&c.label), c.description.as_deref().unwrap_or("")))
            .collect();

        let mut node_ids: Vec<NodeId> = node_hits.iter().map(|n| n.node_id.clone()).collect();
        let mut edge_ids: Vec<EdgeId> = edge_hits.iter().map(|e| e.edge_id.clone()).collect();
        let connection_ids: Vec<NodeId> = connections.iter().map(|c| c.node_id.clone()).collect();

        if let Some(conversation_id) = conversation_id {
            self.merge_cached_findings(
                user,
                conversation_id,
                &mut node_ids,
                &mut node_texts,
                &mut edge_ids,
                &mut edge_texts,
            )
            .await;
        }

        let similar_nodes =
            self.rerank_group(query_text, node_texts, limit, |i| IdSlot::from(node_ids[i].clone())).await?;
        let similar_edges =
            self.rerank_group(query_text, edge_texts, limit, |i| IdSlot::from(edge_ids[i].clone())).await?;
        let connections = self
            .rerank_group(query_text, connection_texts, limit, |i| IdSlot::from(connection_ids[i].clone()))
            .await?;

        if let Some(sink) = &self.audit_sink {
            let mut event = AuditEvent::new(AuditOperation::Query, AuditOutcome::Succeeded);
            event.actor = Some(user.as_str().to_string());
            let _ = sink.record(event);
        }

        Ok(HybridSearchResult { similar_nodes, similar_edges, connections })
    }

    /// Reads `"deep-research:<userId>:<conversationId>"` (§4.8) and folds
    /// any findings not already present into the node/edge candidate
    /// pools, deduped by id. A missing cache, an unset cache client, or
    /// an unparseable/stale entry is silently treated as no findings,
    /// matching "stale entries are silently ignored" (§5).
    async fn merge_cached_findings(
        &self,
        user: &UserId,
        conversation_id: &str,
        node_ids: &mut Vec<NodeId>,
        node_texts: &mut Vec<String>,
        edge_ids: &mut Vec<EdgeId>,
        edge_texts: &mut Vec<String>,
    ) {
        let Some(cache) = &self.deep_research_cache else { return };
        let key = deep_research_cache_key(user, conversation_id);
        let Some(raw) = cache.get(&key).await else { return };
        let Ok(findings) = serde_json::from_str::<Vec<CachedFinding>>(&raw) else { return };

        let mut seen_nodes: HashSet<NodeId> = node_ids.iter().cloned().collect();
        let mut seen_edges: HashSet<EdgeId> = edge_ids.iter().cloned().collect();

        for finding in findings {
            match finding.group.as_str() {
                "node" => {
                    if let Ok(node_id) = TypeId::parse(PREFIX_NODE, &finding.id) {
                        if seen_nodes.insert(node_id.clone()) {
                            node_ids.push(node_id);
                            node_texts.push(finding.text);
                        }
                    }
                }
                "edge" => {
                    if let Ok(edge_id) = TypeId::parse(PREFIX_EDGE, &finding.id) {
                        if seen_edges.insert(edge_id.clone()) {
                            edge_ids.push(edge_id);
                            edge_texts.push(finding.text);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    async fn rerank_group(
        &self,
        query_text: &str,
        texts: Vec<String>,
        limit: usize,
        id_for: impl Fn(usize) -> IdSlot,
    ) -> Result<Vec<RankedItem>, QueryError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut ranked = self
            .reranker
            .rerank(query_text, &texts)
            .await
            .map_err(|e| QueryError::Rerank(e.to_string()))?;
        ranked.truncate(limit);

        Ok(ranked
            .into_iter()
            .map(|r| {
                let slot = id_for(r.index);
                RankedItem {
                    text: texts[r.index].clone(),
                    relevance_score: r.relevance_score,
                    node_id: slot.as_node_id(),
                    edge_id: slot.as_edge_id(),
                }
            })
            .collect())
    }
}

/// Mirrors `jobs::handlers::deep_research::DeepResearchFinding`'s wire
/// shape without a dependency on `jobs` (which depends on `query`) —
/// both sides agree on the JSON, not the type.
#[derive(Debug, Deserialize)]
struct CachedFinding {
    group: String,
    id: String,
    text: String,
}

fn deep_research_cache_key(user: &UserId, conversation_id: &str) -> String {
    format!("deep-research:{}:{}", user.as_str(), conversation_id)
}

fn label_or_unknown(label: &Option<String>) -> &str {
    label.as_deref().unwrap_or("unknown")
}

fn format_edge_text(edge: &SimilarEdge) -> String {
    let src = edge.source_label.as_deref().unwrap_or("unknown");
    let tgt = edge.target_label.as_deref().unwrap_or("unknown");
    match &edge.description {
        Some(desc) if !desc.is_empty() => format!("{src} -> {tgt}: {}: {desc}", edge.edge_type),
        _ => format!("{src} -> {tgt}: {}", edge.edge_type),
    }
}
