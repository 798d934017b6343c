//! The consumer surface for HTTP/tool transport collaborators: enqueues
//! the async jobs that mutate the graph and answers direct reads (search,
//! day/type/graph queries, atlas) against the repository and query engine.
//! Everything here is a thin wrapper — the real algorithms live in `jobs`
//! and `query`.

use chrono::NaiveDate;
use epigraph_core::model::{day_label, NodeId, NodeType, UserId};
use jobs::context::JobContext;
use jobs::handlers::{atlas, cleanup};
use jobs::queue::{
    CleanupGraphPayload, DreamPayload, IngestConversationPayload, IngestDocumentPayload, Job,
    SummarizePayload,
};
use query::QueryInput;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("job error: {0}")]
    Job(#[from] jobs::error::JobError),
    #[error("queue error: {0}")]
    Queue(#[from] anyhow::Error),
}

pub struct MemorySdk {
    ctx: JobContext,
}

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub label: Option<String>,
    pub description: Option<String>,
    pub relevance_score: f32,
}

#[derive(Debug, Clone)]
pub struct EdgeHit {
    pub description: String,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchMemoryResult {
    pub similar_nodes: Vec<MemoryHit>,
    pub similar_edges: Vec<EdgeHit>,
    pub connections: Vec<MemoryHit>,
}

impl MemorySdk {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn ingest_conversation(&self, payload: IngestConversationPayload) -> Result<(), SdkError> {
        self.ctx.job_queue.enqueue(Job::IngestConversation(payload)).await?;
        Ok(())
    }

    pub async fn ingest_document(&self, payload: IngestDocumentPayload) -> Result<(), SdkError> {
        self.ctx.job_queue.enqueue(Job::IngestDocument(payload)).await?;
        Ok(())
    }

    pub async fn summarize(&self, user_id: UserId) -> Result<(), SdkError> {
        self.ctx.job_queue.enqueue(Job::Summarize(SummarizePayload { user_id })).await?;
        Ok(())
    }

    pub async fn dream(&self, user_id: UserId, assistant_id: String, assistant_description: String) -> Result<(), SdkError> {
        self.ctx.job_queue.enqueue(Job::Dream(DreamPayload { user_id, assistant_id, assistant_description })).await?;
        Ok(())
    }

    pub async fn cleanup(&self, payload: CleanupGraphPayload) -> Result<(), SdkError> {
        payload.validate().map_err(jobs::error::JobError::from)?;
        self.ctx.job_queue.enqueue(Job::CleanupGraph(payload)).await?;
        Ok(())
    }

    /// Unlike the other mutating operations, `TruncateLongLabels` has no
    /// job kind of its own — it's a direct maintenance call, not queued.
    pub async fn truncate_long_labels(&self, user_id: &UserId) -> Result<usize, SdkError> {
        Ok(cleanup::truncate_long_labels(&self.ctx, user_id).await?)
    }

    /// `SearchMemory(limit, excludeTypes, conversationId?)`: when
    /// `conversationId` is given, that conversation's cached deep-research
    /// findings (§4.8) are merged into the node/edge candidate pools
    /// before `hybrid_search` reranks them.
    pub async fn search_memory(
        &self,
        user_id: &UserId,
        query_text: &str,
        limit: usize,
        exclude_types: &[NodeType],
        conversation_id: Option<&str>,
    ) -> Result<SearchMemoryResult, SdkError> {
        let result = self
            .ctx
            .query
            .hybrid_search(user_id, query_text, limit, conversation_id)
            .await
            .map_err(jobs::error::JobError::from)?;

        let mut out = SearchMemoryResult::default();
        for item in result.similar_nodes {
            if let Some(hit) = self.to_hit(item, exclude_types).await {
                out.similar_nodes.push(hit);
            }
        }
        for item in result.similar_edges {
            out.similar_edges.push(EdgeHit { description: item.text, relevance_score: item.relevance_score });
        }
        for item in result.connections {
            if let Some(hit) = self.to_hit(item, exclude_types).await {
                out.connections.push(hit);
            }
        }
        Ok(out)
    }

    async fn to_hit(&self, item: query::RankedItem, exclude_types: &[NodeType]) -> Option<MemoryHit> {
        let node_id = item.node_id?;
        let node = self.ctx.repo.get_node(&node_id).await?;
        if exclude_types.contains(&node.node_type) {
            return None;
        }
        let metadata = self.ctx.repo.get_node_metadata(&node_id).await;
        Some(MemoryHit {
            node_id,
            node_type: node.node_type,
            label: metadata.as_ref().and_then(|m| m.label.clone()),
            description: metadata.and_then(|m| m.description),
            relevance_score: item.relevance_score,
        })
    }

    /// `QueryDay(date, formatted?)`: the conversation/event nodes captured
    /// on a given day, optionally pre-joined into one text block.
    pub async fn query_day(&self, user_id: &UserId, date: NaiveDate, formatted: bool) -> Option<QueryDayResult> {
        let day_node_id = self.ctx.repo.find_day_node(user_id, date).await?;
        let neighbors = self.ctx.query.find_one_hop_nodes(user_id, &[day_node_id]).await;
        let text = if formatted {
            Some(
                neighbors
                    .iter()
                    .map(|n| format!("{}: {}", n.label.as_deref().unwrap_or(""), n.description.as_deref().unwrap_or("")))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        } else {
            None
        };
        Some(QueryDayResult { nodes: neighbors, formatted_text: text })
    }

    /// `QueryNodeType(types, date)`: nodes of the given types captured on a
    /// given day.
    pub async fn query_node_type(&self, user_id: &UserId, types: &[NodeType], date: NaiveDate) -> Vec<query::OneHopNode> {
        let Some(day_node_id) = self.ctx.repo.find_day_node(user_id, date).await else { return Vec::new() };
        self.ctx
            .query
            .find_one_hop_nodes(user_id, &[day_node_id])
            .await
            .into_iter()
            .filter(|n| types.contains(&n.node_type))
            .collect()
    }

    /// `QueryGraph(query?, maxNodes)`: a semantically-seeded subgraph when a
    /// query is given, else a plain sample of the user's graph.
    pub async fn query_graph(&self, user_id: &UserId, query_text: Option<&str>, max_nodes: usize) -> Vec<NodeId> {
        match query_text {
            Some(text) => self
                .ctx
                .query
                .find_similar_nodes(user_id, QueryInput::Text(text), max_nodes, None, &[])
                .await
                .map(|hits| hits.into_iter().map(|h| h.node_id).collect())
                .unwrap_or_default(),
            None => {
                let mut ids = self.ctx.repo.node_ids_for_user(user_id).await;
                ids.truncate(max_nodes);
                ids
            }
        }
    }

    /// `QueryAtlas(userId, assistantId)`: both profile descriptions, since
    /// callers generally want the pair together.
    pub async fn query_atlas(&self, user_id: &UserId, assistant_id: &str) -> Result<(Option<String>, Option<String>), SdkError> {
        let user_atlas = atlas::get_atlas(&self.ctx, user_id).await?;
        let assistant_atlas = atlas::get_assistant_atlas(&self.ctx, user_id, assistant_id).await?;
        Ok((user_atlas, assistant_atlas))
    }
}

#[derive(Debug, Clone)]
pub struct QueryDayResult {
    pub nodes: Vec<query::OneHopNode>,
    pub formatted_text: Option<String>,
}

/// Reformats a day label back into a date, for callers that stored it as a
/// plain string (e.g. from a transport layer's query params).
pub fn parse_requested_day(label: &str) -> Option<NaiveDate> {
    epigraph_core::model::parse_day_label(label)
}

pub fn format_day(date: NaiveDate) -> String {
    day_label(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slm::clients::ScriptedCompletionClient;

    async fn test_sdk() -> (MemorySdk, std::sync::Arc<ScriptedCompletionClient>, tempfile::TempDir) {
        use epigraph_core::kv::{InMemoryKeyValueCache, KeyValueCache};
        use ingestion::Extractor;
        use query::QueryEngine;
        use slm::clients::{DeterministicEmbeddingClient, EmbeddingClient, HeuristicRerankClient};
        use std::sync::Arc;
        use storage::wal::Wal;
        use storage::Repository;
        use tokio::sync::Mutex;

        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).await.unwrap();
        let repo = Arc::new(Repository::new(Arc::new(Mutex::new(wal))));
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(DeterministicEmbeddingClient::new("embedding-default-v1"));
        let completion = Arc::new(ScriptedCompletionClient::new());
        let cache: Arc<dyn KeyValueCache> = Arc::new(InMemoryKeyValueCache::default());
        let query = Arc::new(
            QueryEngine::new(repo.clone(), embedder.clone(), Arc::new(HeuristicRerankClient))
                .with_deep_research_cache(cache.clone()),
        );
        let extractor = Arc::new(Extractor::new(repo.clone(), query.clone(), embedder.clone(), completion.clone(), "extraction-model-v1"));
        let (sender, mut receiver) = tokio::sync::mpsc::channel::<Job>(64);
        tokio::spawn(async move { while receiver.recv().await.is_some() {} });
        let job_queue: Arc<dyn jobs::queue::JobQueue> = Arc::new(jobs::queue::ChannelJobQueue::new(sender));
        let ctx = JobContext::new(repo, query, extractor, embedder, completion.clone(), cache, job_queue, "extraction-model-v1", 0.1, 0.4);
        (MemorySdk::new(ctx), completion, dir)
    }

    #[tokio::test]
    async fn ingest_document_then_search_finds_it() {
        let (sdk, completion, _dir) = test_sdk().await;
        completion.push_response(
            ingestion::EXTRACTION_SCHEMA_NAME,
            serde_json::json!({"nodes": [{"id": "temp_person_0", "type": "Person", "label": "Alice", "description": "a person"}], "edges": []}),
        );
        let user = UserId::new("u1");
        sdk.ctx.repo.ensure_user(&user).await.unwrap();
        jobs::handlers::ingest::handle_ingest_document(
            &sdk.ctx,
            IngestDocumentPayload { user_id: user.clone(), document_id: "d1".to_string(), content: "Alice met Bob.".to_string(), timestamp: 100, update_existing: false },
            100,
        )
        .await
        .unwrap();

        let result = sdk.search_memory(&user, "Who is Alice?", 10, &[], None).await.unwrap();
        assert!(result.similar_nodes.iter().any(|h| h.label.as_deref() == Some("Alice")));
    }

    #[tokio::test]
    async fn truncate_long_labels_goes_through_sdk() {
        let (sdk, _completion, _dir) = test_sdk().await;
        let user = UserId::new("u1");
        sdk.ctx.repo.ensure_user(&user).await.unwrap();
        let node = epigraph_core::model::Node::new(user.clone(), NodeType::Concept, 0);
        let metadata = epigraph_core::model::NodeMetadata::new(node.id.clone()).with_label("x".repeat(300));
        sdk.ctx.repo.insert_node_with_metadata(node, metadata).await.unwrap();
        let truncated = sdk.truncate_long_labels(&user).await.unwrap();
        assert_eq!(truncated, 1);
    }
}
