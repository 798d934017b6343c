//! Atlas Processor (spec §4.4): rewrites the per-user and per-assistant
//! "atlas" node descriptions from the previous day's conversation nodes.
//! Both flavors share the same ensure-singleton / one-hop / LLM-rewrite /
//! atomic-replace shape; only the label conventions and retention language
//! differ.

use chrono::NaiveDate;
use epigraph_core::model::{NodeMetadata, NodeType, UserId};
use serde::Deserialize;
use slm::clients::{CompletionError, CompletionMessage};

use crate::context::JobContext;
use crate::error::JobError;

const ATLAS_LABEL: &str = "atlas";
const ATLAS_SCHEMA_NAME: &str = "atlas_rewrite";

#[derive(Debug, Deserialize)]
struct AtlasRewrite {
    description: String,
}

pub async fn get_atlas(ctx: &JobContext, user: &UserId) -> Result<Option<String>, JobError> {
    let Some(node_id) = ctx.repo.find_singleton_by_label(user, NodeType::Atlas, ATLAS_LABEL).await else {
        return Ok(None);
    };
    Ok(ctx.repo.get_node_metadata(&node_id).await.and_then(|m| m.description))
}

pub async fn get_assistant_atlas(ctx: &JobContext, user: &UserId, assistant_id: &str) -> Result<Option<String>, JobError> {
    let Some(node_id) = ctx.repo.find_singleton_by_label(user, NodeType::Atlas, assistant_id).await else {
        return Ok(None);
    };
    Ok(ctx.repo.get_node_metadata(&node_id).await.and_then(|m| m.description))
}

async fn rewrite_atlas(
    ctx: &JobContext,
    atlas_node_id: &epigraph_core::model::NodeId,
    current_description: &str,
    day_facts_xml: &str,
    today: NaiveDate,
    retention_note: &str,
) -> Result<(), JobError> {
    let system = format!(
        "You maintain a running profile built only from facts the user has stated. \
         Rewrite the profile given yesterday's new facts below. Rules: \
         only include user-stated facts, never infer; dates are YYYY-MM-DD; \
         {retention_note} remove facts older than 30 days unless reaffirmed; \
         never duplicate an existing fact; if new facts contradict old ones, \
         the new fact immediately replaces the old one. Today is {today}. \
         Return strict JSON: {{\"description\": string}}.",
    );
    let messages = vec![
        CompletionMessage::system(system),
        CompletionMessage::user(format!(
            "Current profile:\n{current_description}\n\nYesterday's facts:\n{day_facts_xml}"
        )),
    ];
    let raw = ctx.completion.complete_json(&messages, ATLAS_SCHEMA_NAME).await?;
    let parsed: AtlasRewrite = serde_json::from_value(raw)
        .map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))?;

    let metadata = NodeMetadata::new(atlas_node_id.clone())
        .with_label(ATLAS_LABEL.to_string())
        .with_description(parsed.description);
    ctx.repo.update_node_metadata(metadata).await?;
    Ok(())
}

fn format_day_nodes_as_xml(nodes: &[query::engine::OneHopNode]) -> String {
    let mut out = String::from("<conversations>\n");
    for node in nodes.iter().filter(|n| n.node_type == NodeType::Conversation) {
        out.push_str(&format!(
            "  <conversation label=\"{}\">{}</conversation>\n",
            node.label.as_deref().unwrap_or(""),
            node.description.as_deref().unwrap_or(""),
        ));
    }
    out.push_str("</conversations>");
    out
}

/// Rewrites the per-user Atlas from yesterday's conversation nodes.
pub async fn process_atlas_job(ctx: &JobContext, user: &UserId, today: NaiveDate, now: i64) -> Result<(), JobError> {
    let yesterday = today.pred_opt().ok_or_else(|| JobError::Logic("today has no predecessor date".to_string()))?;
    let Some(day_node_id) = ctx.repo.find_day_node(user, yesterday).await else {
        return Ok(());
    };
    let neighbors = ctx.query.find_one_hop_nodes(user, &[day_node_id]).await;
    let conversations_xml = format_day_nodes_as_xml(&neighbors);
    if neighbors.iter().all(|n| n.node_type != NodeType::Conversation) {
        return Ok(());
    }

    let atlas_node_id = ctx.repo.ensure_atlas_node(user, ATLAS_LABEL).await?;
    let current = get_atlas(ctx, user).await?.unwrap_or_default();
    rewrite_atlas(ctx, &atlas_node_id, &current, &conversations_xml, today, "keep this concise;").await?;
    let _ = now;
    Ok(())
}

/// Rewrites the assistant persona's own atlas (self-image, not the user's
/// profile), called from the dream job with a longer retention window.
pub async fn process_assistant_atlas_job(
    ctx: &JobContext,
    user: &UserId,
    assistant_id: &str,
    assistant_description: &str,
    today: NaiveDate,
    now: i64,
) -> Result<(), JobError> {
    let (_, atlas_node_id) = ctx.repo.ensure_assistant_entity_and_atlas_node(user, assistant_id, now).await?;
    let current = get_assistant_atlas(ctx, user, assistant_id).await?.unwrap_or_else(|| assistant_description.to_string());

    let yesterday = today.pred_opt().ok_or_else(|| JobError::Logic("today has no predecessor date".to_string()))?;
    let conversations_xml = match ctx.repo.find_day_node(user, yesterday).await {
        Some(day_node_id) => format_day_nodes_as_xml(&ctx.query.find_one_hop_nodes(user, &[day_node_id]).await),
        None => "<conversations></conversations>".to_string(),
    };

    rewrite_atlas(
        ctx,
        &atlas_node_id,
        &current,
        &conversations_xml,
        today,
        "retain persona traits for 14 days and only drop them after 30 days of no reaffirmation;",
    )
    .await
}
