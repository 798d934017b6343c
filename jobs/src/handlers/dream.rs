//! Dream Processor (spec §4.5): a gated, speculative pass that proposes
//! topics, queries the graph for related memories, and writes up a dream
//! only when the model scores it worth keeping. Runs alongside the
//! assistant-persona atlas rewrite, since both ride the same `dream` job.

use chrono::{NaiveDate, Utc};
use epigraph_core::model::{Edge, EdgeType, Node, NodeEmbedding, NodeMetadata, NodeType, UserId};
use rand::Rng;
use serde::Deserialize;
use slm::clients::{CompletionError, CompletionMessage, EmbeddingKind};

use crate::context::JobContext;
use crate::error::JobError;
use crate::handlers::atlas;
use crate::queue::DreamPayload;

const TOPIC_SCHEMA_NAME: &str = "dream_topics";
const QUERY_SCHEMA_NAME: &str = "dream_queries";
const WRITEUP_SCHEMA_NAME: &str = "dream_writeup";
const MAX_TOPICS: usize = 3;
const MAX_QUERIES_PER_TOPIC: usize = 3;
const NEIGHBOR_LIMIT: usize = 10;
const KEEP_THRESHOLD: f32 = 0.70;

#[derive(Debug, Deserialize)]
struct TopicsResponse {
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueriesResponse {
    queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WriteupResponse {
    dream: String,
    score: f32,
}

#[derive(Debug, Default, Clone)]
pub struct DreamOutcome {
    pub assistant_atlas_rewritten: bool,
    pub topics_considered: usize,
    pub dreams_kept: usize,
}

pub async fn handle_dream(ctx: &JobContext, payload: DreamPayload, now: i64) -> Result<DreamOutcome, JobError> {
    let today = Utc::now().date_naive();
    let mut outcome = DreamOutcome::default();

    atlas::process_assistant_atlas_job(
        ctx, &payload.user_id, &payload.assistant_id, &payload.assistant_description, today, now,
    )
    .await?;
    outcome.assistant_atlas_rewritten = true;

    if !gate(ctx.dream_probability) {
        return Ok(outcome);
    }

    let topics = propose_topics(ctx, &payload).await?;
    outcome.topics_considered = topics.len();

    for topic in topics {
        if !gate(ctx.dream_selection_probability) {
            continue;
        }
        if let Some(()) = dream_about_topic(ctx, &payload, &topic, today, now).await? {
            outcome.dreams_kept += 1;
        }
    }

    Ok(outcome)
}

fn gate(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
}

async fn propose_topics(ctx: &JobContext, payload: &DreamPayload) -> Result<Vec<String>, JobError> {
    let current_atlas = atlas::get_atlas(ctx, &payload.user_id).await?.unwrap_or_default();
    let messages = vec![
        CompletionMessage::system(format!(
            "Propose up to {MAX_TOPICS} topics worth daydreaming about, based on this user's profile. \
             Return strict JSON: {{\"topics\": [string, ...]}} with at most {MAX_TOPICS} entries.",
        )),
        CompletionMessage::user(current_atlas),
    ];
    let raw = ctx.completion.complete_json(&messages, TOPIC_SCHEMA_NAME).await?;
    let mut parsed: TopicsResponse = serde_json::from_value(raw)
        .map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))?;
    parsed.topics.truncate(MAX_TOPICS);
    Ok(parsed.topics)
}

async fn propose_queries(ctx: &JobContext, topic: &str) -> Result<Vec<String>, JobError> {
    let messages = vec![
        CompletionMessage::system(format!(
            "Propose 1 to {MAX_QUERIES_PER_TOPIC} short search queries that would surface memories \
             related to this topic. Return strict JSON: {{\"queries\": [string, ...]}}.",
        )),
        CompletionMessage::user(topic.to_string()),
    ];
    let raw = ctx.completion.complete_json(&messages, QUERY_SCHEMA_NAME).await?;
    let mut parsed: QueriesResponse = serde_json::from_value(raw)
        .map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))?;
    parsed.queries.truncate(MAX_QUERIES_PER_TOPIC);
    Ok(parsed.queries)
}

async fn dream_about_topic(
    ctx: &JobContext,
    payload: &DreamPayload,
    topic: &str,
    today: NaiveDate,
    now: i64,
) -> Result<Option<()>, JobError> {
    let queries = propose_queries(ctx, topic).await?;
    if queries.is_empty() {
        return Ok(None);
    }

    let mut memories_xml = String::from("<memories>\n");
    for query_text in &queries {
        let hits = ctx
            .query
            .find_similar_nodes(&payload.user_id, query::engine::QueryInput::Text(query_text), NEIGHBOR_LIMIT, Some(0.40), &[])
            .await?;
        for hit in hits {
            memories_xml.push_str(&format!(
                "  <memory type=\"{}\">{}</memory>\n",
                hit.node_type,
                hit.description.or(hit.label).unwrap_or_default(),
            ));
        }
    }
    memories_xml.push_str("</memories>");

    let messages = vec![
        CompletionMessage::system(
            "Write a short speculative reflection (a \"dream\") connecting these memories around the \
             given topic, then rate how insightful and worth keeping it is from 0.0 to 1.0. \
             Return strict JSON: {\"dream\": string, \"score\": number}.",
        ),
        CompletionMessage::user(format!("Topic: {topic}\n\n{memories_xml}")),
    ];
    let raw = ctx.completion.complete_json(&messages, WRITEUP_SCHEMA_NAME).await?;
    let parsed: WriteupResponse = serde_json::from_value(raw)
        .map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))?;

    if parsed.score < KEEP_THRESHOLD {
        return Ok(None);
    }

    persist_dream(ctx, payload, &parsed.dream, topic, today, now).await?;
    Ok(Some(()))
}

async fn persist_dream(
    ctx: &JobContext,
    payload: &DreamPayload,
    dream_text: &str,
    topic: &str,
    today: NaiveDate,
    now: i64,
) -> Result<(), JobError> {
    let node = Node::new(payload.user_id.clone(), NodeType::AssistantDream, now);
    let metadata = NodeMetadata::new(node.id.clone())
        .with_label(topic.to_string())
        .with_description(dream_text.to_string());
    let node_id = ctx.repo.insert_node_with_metadata(node, metadata).await?;

    let day_node_id = ctx.repo.ensure_day_node(&payload.user_id, today, now).await?;
    if let Ok(edge) = Edge::new(payload.user_id.clone(), node_id.clone(), day_node_id, EdgeType::CapturedIn, now) {
        ctx.repo.insert_edges(vec![edge]).await?;
    }

    let vector = ctx.embedder.embed_one(dream_text, EmbeddingKind::Passage).await.map_err(|e| JobError::Logic(e.to_string()))?;
    if let Ok(embedding) = NodeEmbedding::new(node_id, vector, ctx.model_id.clone()) {
        ctx.repo.insert_node_embedding(embedding).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_never_fires_at_zero_probability() {
        assert!(!gate(0.0));
    }

    #[test]
    fn gate_always_fires_at_one_probability() {
        assert!(gate(1.0));
    }

    #[tokio::test]
    async fn dream_skips_when_probability_gate_is_zero() {
        let (ctx, _completion, _dir) = crate::test_support::test_context().await;
        let mut ctx = ctx;
        ctx.dream_probability = 0.0;
        ctx.repo.ensure_user(&UserId::new("u1")).await.unwrap();
        let outcome = handle_dream(
            &ctx,
            DreamPayload { user_id: UserId::new("u1"), assistant_id: "assistant-1".to_string(), assistant_description: "Helpful assistant".to_string() },
            0,
        )
        .await
        .unwrap();
        assert!(outcome.assistant_atlas_rewritten);
        assert_eq!(outcome.topics_considered, 0);
        assert_eq!(outcome.dreams_kept, 0);
    }
}
