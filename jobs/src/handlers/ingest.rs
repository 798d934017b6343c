//! `ingest-conversation` / `ingest-document` handlers (spec §4.3, §4.8).
//! Both create the source's linked node via `EnsureSourceNode`, run the
//! Extractor over the formatted content, and flip the source's status
//! through `processing -> completed`.

use epigraph_core::model::{NodeId, NodeType, Source, SourceStatus, SourceType};
use ingestion::{ExtractionOutcome, SourceKind};
use std::time::Duration;

use crate::context::JobContext;
use crate::error::JobError;
use crate::queue::{DeepResearchPayload, IngestConversationPayload, IngestDocumentPayload, Job};

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub linked_node_id: NodeId,
    pub extraction: Option<ExtractionOutcome>,
    pub inserted_message_sources: usize,
    pub deep_research_enqueued: bool,
}

fn throttle_key(user_id: &str, conversation_id: &str) -> String {
    format!("deep-research-throttle:{user_id}:{conversation_id}")
}

const DEEP_RESEARCH_THROTTLE_SECS: u64 = 60;

pub async fn handle_ingest_conversation(
    ctx: &JobContext,
    payload: IngestConversationPayload,
    now: i64,
) -> Result<IngestOutcome, JobError> {
    ctx.repo.ensure_user(&payload.user_id).await?;

    let mut conversation_source = Source::new(
        payload.user_id.clone(),
        SourceType::Conversation,
        payload.conversation_id.clone(),
        None,
        now,
    )?;
    conversation_source.status = SourceStatus::Processing;
    let conversation_source = ctx.repo.upsert_source(conversation_source).await?;

    let conversation_node_id = ctx
        .repo
        .ensure_source_node(&payload.user_id, conversation_source.id.clone(), now, NodeType::Conversation)
        .await?;

    let mut message_sources = Vec::with_capacity(payload.messages.len());
    for message in &payload.messages {
        let mut source = Source::new(
            payload.user_id.clone(),
            SourceType::ConversationMessage,
            message.id.clone(),
            Some(conversation_source.id.clone()),
            message.timestamp,
        )?;
        source.metadata = Some(
            serde_json::json!({
                "role": message.role,
                "name": message.name,
                "content": message.content,
            })
            .to_string(),
        );
        source.status = SourceStatus::Completed;
        message_sources.push(source);
    }
    let inserted = ctx.repo.insert_sources(message_sources).await?;

    let content = format_messages_as_xml(&payload.messages);
    let extraction = ctx
        .extractor
        .extract(&payload.user_id, SourceKind::Conversation, &conversation_node_id, &content, now)
        .await?;

    let mut completed = conversation_source.clone();
    completed.status = SourceStatus::Completed;
    ctx.repo.upsert_source(completed).await?;

    let key = throttle_key(payload.user_id.as_str(), &payload.conversation_id);
    let deep_research_enqueued = ctx
        .cache
        .set_nx_ex(&key, "1".to_string(), Duration::from_secs(DEEP_RESEARCH_THROTTLE_SECS))
        .await;
    if deep_research_enqueued {
        let enqueue_result = ctx
            .job_queue
            .enqueue(Job::DeepResearch(DeepResearchPayload {
                user_id: payload.user_id.clone(),
                conversation_id: payload.conversation_id.clone(),
                messages: payload.messages.clone(),
                last_n_messages: 3,
            }))
            .await;
        if let Err(e) = enqueue_result {
            tracing::warn!(error = %e, "failed to enqueue deep-research job");
        }
    }

    Ok(IngestOutcome {
        linked_node_id: conversation_node_id,
        extraction: Some(extraction),
        inserted_message_sources: inserted.len(),
        deep_research_enqueued,
    })
}

pub async fn handle_ingest_document(
    ctx: &JobContext,
    payload: IngestDocumentPayload,
    now: i64,
) -> Result<IngestOutcome, JobError> {
    ctx.repo.ensure_user(&payload.user_id).await?;

    let existing = ctx
        .repo
        .find_source(&payload.user_id, SourceType::Document, &payload.document_id)
        .await;

    if let Some(existing_source) = &existing {
        if payload.update_existing {
            if let Some(node_id) = ctx.repo.node_for_source(&existing_source.id).await {
                ctx.repo.delete_node_cascade(&node_id).await?;
            }
        } else {
            let node_id = ctx.repo.node_for_source(&existing_source.id).await.ok_or_else(|| {
                JobError::Logic("document source already ingested but has no linked node".to_string())
            })?;
            return Ok(IngestOutcome {
                linked_node_id: node_id,
                extraction: None,
                inserted_message_sources: 0,
                deep_research_enqueued: false,
            });
        }
    }

    let mut source = Source::new(
        payload.user_id.clone(),
        SourceType::Document,
        payload.document_id.clone(),
        None,
        payload.timestamp,
    )?;
    source.status = SourceStatus::Processing;
    let source = ctx.repo.upsert_source(source).await?;

    let linked_node_id = ctx
        .repo
        .ensure_source_node(&payload.user_id, source.id.clone(), payload.timestamp, NodeType::Document)
        .await?;

    let extraction = ctx
        .extractor
        .extract(&payload.user_id, SourceKind::Document, &linked_node_id, &payload.content, payload.timestamp)
        .await?;

    let mut completed = source.clone();
    completed.status = SourceStatus::Completed;
    ctx.repo.upsert_source(completed).await?;

    Ok(IngestOutcome {
        linked_node_id,
        extraction: Some(extraction),
        inserted_message_sources: 0,
        deep_research_enqueued: false,
    })
}

fn format_messages_as_xml(messages: &[epigraph_core::ingest::ConversationMessage]) -> String {
    let mut out = String::from("<conversation>\n");
    for message in messages {
        let name_attr = message
            .name
            .as_deref()
            .map(|n| format!(" name=\"{}\"", escape_xml(n)))
            .unwrap_or_default();
        out.push_str(&format!(
            "  <message id=\"{}\" role=\"{}\"{}>{}</message>\n",
            escape_xml(&message.id),
            escape_xml(&message.role),
            name_attr,
            escape_xml(&message.content),
        ));
    }
    out.push_str("</conversation>");
    out
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
