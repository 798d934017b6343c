//! Deep Research (spec §4.8): chases tangential queries a few hops past
//! the direct hybrid search, asking the model after each round which
//! finds to keep and whether another round is worth running, then caches
//! the settled result for the search endpoint to read back.

use query::QueryInput;
use serde::Deserialize;
use slm::clients::{CompletionError, CompletionMessage};
use std::collections::HashSet;
use std::time::Duration;

use crate::context::JobContext;
use crate::error::JobError;
use crate::queue::DeepResearchPayload;

const TANGENT_SCHEMA_NAME: &str = "deep_research_tangents";
const CONTINUE_SCHEMA_NAME: &str = "deep_research_continue";
const MAX_TANGENT_QUERIES: usize = 5;
const MAX_ROUNDS: usize = 4;
const PER_QUERY_LIMIT: usize = 10;
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
struct TangentsResponse {
    queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ContinueResponse {
    #[serde(rename = "dropIds", default)]
    drop_ids: Vec<String>,
    #[serde(rename = "continue")]
    should_continue: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeepResearchFinding {
    pub group: &'static str,
    pub id: String,
    pub text: String,
}

fn cache_key(user_id: &str, conversation_id: &str) -> String {
    format!("deep-research:{user_id}:{conversation_id}")
}

pub async fn handle_deep_research(ctx: &JobContext, payload: DeepResearchPayload) -> Result<Vec<DeepResearchFinding>, JobError> {
    let recent_text = payload
        .messages
        .iter()
        .rev()
        .take(payload.last_n_messages.max(1))
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let queries = propose_tangent_queries(ctx, &recent_text).await?;
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen: HashSet<(&'static str, String)> = HashSet::new();
    let mut findings: Vec<DeepResearchFinding> = Vec::new();

    for round in 0..MAX_ROUNDS {
        let mut round_findings = Vec::new();
        for query_text in &queries {
            let node_hits = ctx
                .query
                .find_similar_nodes(&payload.user_id, QueryInput::Text(query_text), PER_QUERY_LIMIT, Some(query::MIN_SIM_DEEP_RESEARCH), &[])
                .await?;
            for hit in node_hits {
                let id = hit.node_id.as_str().to_string();
                if seen.insert(("node", id.clone())) {
                    round_findings.push(DeepResearchFinding {
                        group: "node",
                        id,
                        text: hit.description.or(hit.label).unwrap_or_default(),
                    });
                }
            }

            let edge_hits = ctx
                .query
                .find_similar_edges(&payload.user_id, QueryInput::Text(query_text), PER_QUERY_LIMIT, Some(query::MIN_SIM_DEEP_RESEARCH))
                .await?;
            for hit in edge_hits {
                let id = hit.edge_id.as_str().to_string();
                if seen.insert(("edge", id.clone())) {
                    round_findings.push(DeepResearchFinding {
                        group: "edge",
                        id,
                        text: hit.description.unwrap_or_else(|| format!("{} {} {}", hit.source_label.unwrap_or_default(), hit.edge_type, hit.target_label.unwrap_or_default())),
                    });
                }
            }
        }

        if round_findings.is_empty() {
            break;
        }
        findings.extend(round_findings);

        if round + 1 >= MAX_ROUNDS {
            break;
        }
        let decision = ask_whether_to_continue(ctx, &recent_text, &findings).await?;
        findings.retain(|f| !decision.drop_ids.contains(&f.id));
        if !decision.should_continue {
            break;
        }
    }

    let key = cache_key(payload.user_id.as_str(), &payload.conversation_id);
    let serialized = serde_json::to_string(&findings).unwrap_or_default();
    ctx.cache.set_ex(&key, serialized, CACHE_TTL).await;

    Ok(findings)
}

async fn propose_tangent_queries(ctx: &JobContext, recent_text: &str) -> Result<Vec<String>, JobError> {
    let messages = vec![
        CompletionMessage::system(format!(
            "Given the tail of a conversation, propose up to {MAX_TANGENT_QUERIES} short search \
             queries for tangentially related memories worth surfacing later. Return strict JSON: \
             {{\"queries\": [string, ...]}}.",
        )),
        CompletionMessage::user(recent_text.to_string()),
    ];
    let raw = ctx.completion.complete_json(&messages, TANGENT_SCHEMA_NAME).await?;
    let mut parsed: TangentsResponse = serde_json::from_value(raw)
        .map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))?;
    parsed.queries.truncate(MAX_TANGENT_QUERIES);
    Ok(parsed.queries)
}

async fn ask_whether_to_continue(
    ctx: &JobContext,
    recent_text: &str,
    findings: &[DeepResearchFinding],
) -> Result<ContinueResponse, JobError> {
    let findings_text = findings
        .iter()
        .map(|f| format!("[{}] {}: {}", f.group, f.id, f.text))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = vec![
        CompletionMessage::system(
            "Given the conversation tail and the findings gathered so far, list the ids of any \
             findings irrelevant enough to drop, and say whether another research round is worth \
             running. Return strict JSON: {\"dropIds\": [string, ...], \"continue\": boolean}.",
        ),
        CompletionMessage::user(format!("Conversation:\n{recent_text}\n\nFindings:\n{findings_text}")),
    ];
    let raw = ctx.completion.complete_json(&messages, CONTINUE_SCHEMA_NAME).await?;
    serde_json::from_value(raw).map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))
}
