//! The typed job payloads (§6) and the queue trait the worker drains.
//! The durable Redis-backed queue itself is an external collaborator
//! (§2: "a Redis-like key/value with TTL... assumed given"); `ChannelJobQueue`
//! is the in-process stand-in used by the worker and its tests.

use epigraph_core::ingest::ConversationMessage;
use epigraph_core::model::{NodeId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConversationPayload {
    pub user_id: UserId,
    pub conversation_id: String,
    pub messages: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestDocumentPayload {
    pub user_id: UserId,
    pub document_id: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub update_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizePayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DreamPayload {
    pub user_id: UserId,
    pub assistant_id: String,
    pub assistant_description: String,
}

fn default_last_n_messages() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResearchPayload {
    pub user_id: UserId,
    pub conversation_id: String,
    pub messages: Vec<ConversationMessage>,
    #[serde(default = "default_last_n_messages")]
    pub last_n_messages: usize,
}

fn default_entry_node_limit() -> usize {
    5
}
fn default_semantic_neighbor_limit() -> usize {
    15
}
fn default_graph_hop_depth() -> u8 {
    2
}
fn default_max_subgraph_nodes() -> usize {
    100
}
fn default_max_subgraph_edges() -> usize {
    150
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupGraphPayload {
    pub user_id: UserId,
    pub since: i64,
    #[serde(default = "default_entry_node_limit")]
    pub entry_node_limit: usize,
    #[serde(default = "default_semantic_neighbor_limit")]
    pub semantic_neighbor_limit: usize,
    #[serde(default = "default_graph_hop_depth")]
    pub graph_hop_depth: u8,
    #[serde(default = "default_max_subgraph_nodes")]
    pub max_subgraph_nodes: usize,
    #[serde(default = "default_max_subgraph_edges")]
    pub max_subgraph_edges: usize,
    pub llm_model_id: String,
    #[serde(default)]
    pub seed_ids: Option<Vec<NodeId>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadValidationError {
    #[error("graphHopDepth must be 1 or 2, got {0}")]
    InvalidHopDepth(u8),
}

use thiserror::Error;

impl CleanupGraphPayload {
    pub fn validate(&self) -> Result<(), PayloadValidationError> {
        if self.graph_hop_depth != 1 && self.graph_hop_depth != 2 {
            return Err(PayloadValidationError::InvalidHopDepth(self.graph_hop_depth));
        }
        Ok(())
    }
}

/// One named job kind per §4.9, carrying the schema-validated payload its
/// handler expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    IngestConversation(IngestConversationPayload),
    IngestDocument(IngestDocumentPayload),
    Summarize(SummarizePayload),
    Dream(DreamPayload),
    DeepResearch(DeepResearchPayload),
    CleanupGraph(CleanupGraphPayload),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::IngestConversation(_) => "ingest-conversation",
            Job::IngestDocument(_) => "ingest-document",
            Job::Summarize(_) => "summarize",
            Job::Dream(_) => "dream",
            Job::DeepResearch(_) => "deep-research",
            Job::CleanupGraph(_) => "cleanup-graph",
        }
    }
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;
}

/// In-process queue backed by a Tokio channel. Stands in for the durable
/// Redis-backed queue (§6) in tests and single-process deployments.
pub struct ChannelJobQueue {
    sender: mpsc::Sender<Job>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<Job>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        self.sender.send(job).await.map_err(|e| anyhow::anyhow!("queue send error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_payload_rejects_invalid_hop_depth() {
        let payload = CleanupGraphPayload {
            user_id: UserId::new("u1"),
            since: 0,
            entry_node_limit: 5,
            semantic_neighbor_limit: 15,
            graph_hop_depth: 3,
            max_subgraph_nodes: 100,
            max_subgraph_edges: 150,
            llm_model_id: "m".to_string(),
            seed_ids: None,
        };
        assert_eq!(payload.validate(), Err(PayloadValidationError::InvalidHopDepth(3)));
    }
}
