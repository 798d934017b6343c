//! External service contracts (§6): embedding, rerank, and schema-constrained
//! completion. Every production caller wires a real HTTP-backed
//! implementation in here; the deterministic/heuristic implementations
//! below keep the rest of the crate testable without a network.

use async_trait::async_trait;
use epigraph_core::embedding::deterministic_embedding;
use epigraph_core::model::EMBEDDING_DIMS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Whether an embedding input is the user's query or a stored passage —
/// some embedding APIs use asymmetric encoders and need to know which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Query,
    Passage,
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, inputs: &[String], kind: EmbeddingKind) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, input: &str, kind: EmbeddingKind) -> anyhow::Result<Vec<f32>> {
        Ok(self
            .embed(&[input.to_string()], kind)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default())
    }
}

/// SHA256-hash fallback embedder: deterministic, dimension-correct, no
/// network. `kind` is folded into the model id so query/passage vectors
/// for the same text don't collide.
pub struct DeterministicEmbeddingClient {
    model_id: String,
}

impl DeterministicEmbeddingClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self { model_id: model_id.into() }
    }
}

#[async_trait]
impl EmbeddingClient for DeterministicEmbeddingClient {
    async fn embed(&self, inputs: &[String], kind: EmbeddingKind) -> anyhow::Result<Vec<Vec<f32>>> {
        let suffix = match kind {
            EmbeddingKind::Query => "retrieval.query",
            EmbeddingKind::Passage => "retrieval.passage",
        };
        let model_id = format!("{}:{suffix}", self.model_id);
        Ok(inputs
            .iter()
            .map(|text| deterministic_embedding(text, &model_id, EMBEDDING_DIMS))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f32,
}

#[async_trait]
pub trait RerankClient: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<Vec<RerankResult>>;
}

/// Lexical-overlap reranker: scores each document by the fraction of
/// query tokens it contains. Deterministic stand-in for a cross-encoder.
pub struct HeuristicRerankClient;

#[async_trait]
impl RerankClient for HeuristicRerankClient {
    async fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<Vec<RerankResult>> {
        let query_tokens: Vec<String> = tokenize(query);
        let mut scored: Vec<RerankResult> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let doc_tokens = tokenize(doc);
                let score = overlap_score(&query_tokens, &doc_tokens);
                RerankResult { index, relevance_score: score }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });
        Ok(scored)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn overlap_score(query_tokens: &[String], doc_tokens: &[String]) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_set: std::collections::HashSet<&String> = doc_tokens.iter().collect();
    let hits = query_tokens.iter().filter(|t| doc_set.contains(t)).count();
    hits as f32 / query_tokens.len() as f32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

impl CompletionMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion could not be parsed against the requested schema: {0}")]
    LlmParseError(String),
    #[error("completion backend is unavailable: {0}")]
    TransientBackendError(String),
}

/// Schema-constrained JSON completion. Implementations must guarantee a
/// well-typed parsed object or raise [`CompletionError::LlmParseError`] —
/// never a best-effort partial parse.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete_json(
        &self,
        messages: &[CompletionMessage],
        schema_name: &str,
    ) -> Result<serde_json::Value, CompletionError>;
}

/// Test/offline completion client: returns a canned response keyed by
/// `schema_name`, falling back to an empty object. Lets job handler tests
/// exercise the full pipeline without a real completion endpoint.
#[derive(Default)]
pub struct ScriptedCompletionClient {
    responses: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl ScriptedCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response to be returned the next time `schema_name` is
    /// requested (FIFO per schema).
    pub fn push_response(&self, schema_name: impl Into<String>, response: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(schema_name.into())
            .or_default()
            .push(response);
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete_json(
        &self,
        _messages: &[CompletionMessage],
        schema_name: &str,
    ) -> Result<serde_json::Value, CompletionError> {
        let mut responses = self.responses.lock().unwrap();
        let queue = responses.entry(schema_name.to_string()).or_default();
        if queue.is_empty() {
            return Err(CompletionError::LlmParseError(format!(
                "no scripted response queued for schema {schema_name}"
            )));
        }
        Ok(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_embedding_client_is_reproducible() {
        let client = DeterministicEmbeddingClient::new("embedding-default-v1");
        let a = client.embed_one("hello world", EmbeddingKind::Query).await.unwrap();
        let b = client.embed_one("hello world", EmbeddingKind::Query).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMS);
    }

    #[tokio::test]
    async fn query_and_passage_embeddings_differ() {
        let client = DeterministicEmbeddingClient::new("embedding-default-v1");
        let q = client.embed_one("hello world", EmbeddingKind::Query).await.unwrap();
        let p = client.embed_one("hello world", EmbeddingKind::Passage).await.unwrap();
        assert_ne!(q, p);
    }

    #[tokio::test]
    async fn heuristic_rerank_prefers_lexical_overlap() {
        let client = HeuristicRerankClient;
        let docs = vec!["Alice met Bob in Paris".to_string(), "Unrelated weather report".to_string()];
        let ranked = client.rerank("Alice Paris", &docs).await.unwrap();
        assert_eq!(ranked[0].index, 0);
    }

    #[tokio::test]
    async fn scripted_completion_client_returns_queued_response() {
        let client = ScriptedCompletionClient::new();
        client.push_response("extraction", serde_json::json!({"nodes": [], "edges": []}));
        let result = client
            .complete_json(&[CompletionMessage::user("hi")], "extraction")
            .await
            .unwrap();
        assert_eq!(result["nodes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn scripted_completion_client_errors_when_empty() {
        let client = ScriptedCompletionClient::new();
        let result = client
            .complete_json(&[CompletionMessage::user("hi")], "missing")
            .await;
        assert!(matches!(result, Err(CompletionError::LlmParseError(_))));
    }
}
