//! Cleanup Engine (spec §4.6): builds a bounded subgraph around a set of
//! entry nodes, asks the model to merge/delete/add onto it through a
//! Temporary-ID Mapper, applies the result, then seeds a follow-up round
//! from whatever the previous round touched.

use epigraph_core::model::{Edge, EdgeType, Node, NodeId, NodeMetadata, NodeType, UserId};
use epigraph_core::tempid::TempIdMapper;
use query::QueryInput;
use serde::Deserialize;
use slm::clients::{CompletionError, CompletionMessage};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::context::JobContext;
use crate::error::JobError;
use crate::handlers::atlas;
use crate::queue::CleanupGraphPayload;

const CLEANUP_SCHEMA_NAME: &str = "graph_cleanup";
const LABEL_LIMIT: usize = 255;
const MAX_ITERATIONS: usize = 3;
const MIN_SUBGRAPH_NODES_FOR_FOLLOWUP: usize = 5;

#[derive(Debug, Deserialize)]
struct LlmNewNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    label: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmMerge {
    keep: String,
    #[serde(rename = "mergeInto")]
    merge_into: Vec<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmAddition {
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
struct CleanupResponse {
    #[serde(default)]
    merges: Vec<LlmMerge>,
    #[serde(default)]
    deletes: Vec<String>,
    #[serde(default)]
    additions: Vec<LlmAddition>,
    #[serde(rename = "newNodes", default)]
    new_nodes: Vec<LlmNewNode>,
}

#[derive(Debug, Default, Clone)]
pub struct CleanupOutcome {
    pub iterations_run: usize,
    pub nodes_merged: usize,
    pub nodes_deleted: usize,
    pub edges_added: usize,
    pub nodes_created: usize,
}

struct SubgraphNode {
    node_id: NodeId,
    node_type: NodeType,
    label: Option<String>,
    description: Option<String>,
}

struct SubgraphEdge {
    source_id: NodeId,
    target_id: NodeId,
    edge_type: EdgeType,
}

pub async fn handle_cleanup(ctx: &JobContext, payload: CleanupGraphPayload, now: i64) -> Result<CleanupOutcome, JobError> {
    payload.validate()?;
    let mut outcome = CleanupOutcome::default();

    let mut seeds = match &payload.seed_ids {
        Some(ids) if !ids.is_empty() => ids.clone(),
        _ => ctx.repo.fetch_entry_nodes(&payload.user_id, payload.since, payload.entry_node_limit).await,
    };

    for _ in 0..MAX_ITERATIONS {
        if seeds.is_empty() {
            break;
        }
        let (nodes, edges) = build_subgraph(ctx, &payload, &seeds).await?;
        if nodes.len() < MIN_SUBGRAPH_NODES_FOR_FOLLOWUP && outcome.iterations_run > 0 {
            break;
        }

        let followup_seeds = apply_one_round(ctx, &payload, &nodes, &edges, now, &mut outcome).await?;
        outcome.iterations_run += 1;
        seeds = followup_seeds;
    }

    Ok(outcome)
}

async fn build_subgraph(
    ctx: &JobContext,
    payload: &CleanupGraphPayload,
    seeds: &[NodeId],
) -> Result<(Vec<SubgraphNode>, Vec<SubgraphEdge>), JobError> {
    let mut node_by_id: HashMap<NodeId, SubgraphNode> = HashMap::new();
    let mut edge_keys: HashSet<(NodeId, NodeId, EdgeType)> = HashSet::new();
    let mut edges = Vec::new();

    for seed in seeds {
        let Some(node) = ctx.repo.get_node(seed).await else { continue };
        let metadata = ctx.repo.get_node_metadata(seed).await;
        node_by_id.entry(seed.clone()).or_insert(SubgraphNode {
            node_id: seed.clone(),
            node_type: node.node_type,
            label: metadata.as_ref().and_then(|m| m.label.clone()),
            description: metadata.and_then(|m| m.description),
        });

        if let Some(label) = node_by_id.get(seed).and_then(|n| n.label.clone()) {
            let semantic = ctx
                .query
                .find_similar_nodes(&payload.user_id, QueryInput::Text(&label), payload.semantic_neighbor_limit, Some(query::MIN_SIM_CLEANUP), &[])
                .await?;
            for hit in semantic {
                if node_by_id.len() >= payload.max_subgraph_nodes {
                    break;
                }
                node_by_id.entry(hit.node_id.clone()).or_insert(SubgraphNode {
                    node_id: hit.node_id,
                    node_type: hit.node_type,
                    label: hit.label,
                    description: hit.description,
                });
            }
        }
    }

    let mut frontier: VecDeque<NodeId> = seeds.iter().cloned().collect();
    for _ in 0..payload.graph_hop_depth {
        let mut next_frontier = VecDeque::new();
        while let Some(current) = frontier.pop_front() {
            if edges.len() >= payload.max_subgraph_edges {
                break;
            }
            for neighbor in ctx.repo.one_hop(&current).await {
                let key = (neighbor.source_node_id.clone(), neighbor.target_node_id.clone(), neighbor.edge_type);
                if !edge_keys.insert(key) {
                    continue;
                }
                edges.push(SubgraphEdge {
                    source_id: neighbor.source_node_id,
                    target_id: neighbor.target_node_id,
                    edge_type: neighbor.edge_type,
                });
                if node_by_id.len() < payload.max_subgraph_nodes && !node_by_id.contains_key(&neighbor.node_id) {
                    if let Some(node) = ctx.repo.get_node(&neighbor.node_id).await {
                        let metadata = ctx.repo.get_node_metadata(&neighbor.node_id).await;
                        node_by_id.insert(neighbor.node_id.clone(), SubgraphNode {
                            node_id: neighbor.node_id.clone(),
                            node_type: node.node_type,
                            label: metadata.as_ref().and_then(|m| m.label.clone()),
                            description: metadata.and_then(|m| m.description),
                        });
                        next_frontier.push_back(neighbor.node_id);
                    }
                }
            }
            if edges.len() >= payload.max_subgraph_edges {
                break;
            }
        }
        frontier = next_frontier;
    }

    Ok((node_by_id.into_values().collect(), edges))
}

fn temp_id_for(mapper: &mut TempIdMapper<NodeId>, ordinals: &mut HashMap<NodeType, usize>, node_type: NodeType, node_id: &NodeId) -> String {
    if let Some(existing) = mapper.temp_id_for(node_id) {
        return existing.to_string();
    }
    let ordinal = ordinals.entry(node_type).or_insert(0);
    let temp_id = format!("temp_{}_{}", node_type.as_wire().to_lowercase(), ordinal);
    *ordinal += 1;
    let _ = mapper.register(&temp_id, node_id.clone());
    temp_id
}

async fn apply_one_round(
    ctx: &JobContext,
    payload: &CleanupGraphPayload,
    nodes: &[SubgraphNode],
    edges: &[SubgraphEdge],
    now: i64,
    outcome: &mut CleanupOutcome,
) -> Result<Vec<NodeId>, JobError> {
    let mut mapper: TempIdMapper<NodeId> = TempIdMapper::new();
    let mut ordinals: HashMap<NodeType, usize> = HashMap::new();

    let mut node_lines = Vec::with_capacity(nodes.len());
    for node in nodes {
        let temp_id = temp_id_for(&mut mapper, &mut ordinals, node.node_type, &node.node_id);
        node_lines.push(format!(
            "{temp_id}: {} \"{}\"{}",
            node.node_type,
            node.label.as_deref().unwrap_or(""),
            node.description.as_deref().map(|d| format!(" - {d}")).unwrap_or_default(),
        ));
    }
    let mut edge_lines = Vec::with_capacity(edges.len());
    for edge in edges {
        let Some(src_temp) = mapper.temp_id_for(&edge.source_id).map(str::to_string) else { continue };
        let Some(tgt_temp) = mapper.temp_id_for(&edge.target_id).map(str::to_string) else { continue };
        edge_lines.push(format!("{src_temp} -{}-> {tgt_temp}", edge.edge_type));
    }

    let current_atlas = atlas::get_atlas(ctx, &payload.user_id).await?.unwrap_or_default();
    let system = format!(
        "You clean up a personal knowledge graph. Merge duplicate entities, delete stale or \
         redundant nodes, add missing edges you can infer with confidence, and add at most a \
         few new nodes if clearly implied. Node types: {}. Edge types: {}. Reference nodes only \
         by their given temp id; new nodes must use an id of the form temp_<type>_<n>. \
         Never contradict the user profile below. Return strict JSON: \
         {{\"merges\":[{{\"keep\",\"mergeInto\":[...],\"label\",\"description\"}}],\
         \"deletes\":[tempId,...],\
         \"additions\":[{{\"sourceId\",\"targetId\",\"type\",\"description\"}}],\
         \"newNodes\":[{{\"id\",\"type\",\"label\",\"description\"}}]}}.",
        NodeType::ALL.iter().map(|t| t.as_wire()).collect::<Vec<_>>().join(", "),
        EdgeType::ALL.iter().map(|t| t.as_wire()).collect::<Vec<_>>().join(", "),
    );
    let user_prompt = format!(
        "User profile:\n{current_atlas}\n\nNodes:\n{}\n\nEdges:\n{}",
        node_lines.join("\n"),
        edge_lines.join("\n"),
    );
    let messages = vec![CompletionMessage::system(system), CompletionMessage::user(user_prompt)];
    let raw = ctx.completion.complete_json(&messages, CLEANUP_SCHEMA_NAME).await?;
    let parsed: CleanupResponse = serde_json::from_value(raw)
        .map_err(|e| JobError::Completion(CompletionError::LlmParseError(e.to_string())))?;

    let mut followup_seeds: Vec<NodeId> = Vec::new();

    // newNodes first so merges/additions can reference them.
    for llm_node in &parsed.new_nodes {
        if mapper.contains_temp_id(&llm_node.id) {
            continue;
        }
        let Some(node_type) = NodeType::from_wire(&llm_node.node_type) else { continue };
        let node = Node::new(payload.user_id.clone(), node_type, now);
        let mut metadata = NodeMetadata::new(node.id.clone()).with_label(llm_node.label.clone());
        if let Some(desc) = &llm_node.description {
            metadata = metadata.with_description(desc.clone());
        }
        let node_id = ctx.repo.insert_node_with_metadata(node, metadata).await?;
        if mapper.register(&llm_node.id, node_id.clone()).is_ok() {
            outcome.nodes_created += 1;
            followup_seeds.push(node_id);
        }
    }

    // Merges: rewire edges/source links from each absorbed node onto `keep`, then delete it.
    for merge in &parsed.merges {
        let Some(keep_id) = mapper.resolve(&merge.keep).cloned() else { continue };
        if let Some(label) = &merge.label {
            let mut metadata = NodeMetadata::new(keep_id.clone()).with_label(label.clone());
            if let Some(desc) = &merge.description {
                metadata = metadata.with_description(desc.clone());
            }
            ctx.repo.update_node_metadata(metadata).await?;
        }
        for absorbed_temp in &merge.merge_into {
            if absorbed_temp == &merge.keep {
                continue;
            }
            let Some(absorbed_id) = mapper.resolve(absorbed_temp).cloned() else { continue };
            ctx.repo.rewire_edges(&absorbed_id, &keep_id, now).await?;
            ctx.repo.rewire_source_links(&absorbed_id, &keep_id).await?;
            ctx.repo.delete_node_cascade(&absorbed_id).await?;
            outcome.nodes_merged += 1;
        }
        followup_seeds.push(keep_id);
    }

    let merged_away: HashSet<String> = parsed
        .merges
        .iter()
        .flat_map(|m| m.merge_into.iter().filter(|t| *t != &m.keep))
        .cloned()
        .collect();

    // Additions.
    let mut new_edges = Vec::new();
    for addition in &parsed.additions {
        let Some(edge_type) = EdgeType::from_wire(&addition.edge_type) else { continue };
        let Some(src) = mapper.resolve(&addition.source_id).cloned() else { continue };
        let Some(tgt) = mapper.resolve(&addition.target_id).cloned() else { continue };
        let mut edge = match Edge::new(payload.user_id.clone(), src.clone(), tgt.clone(), edge_type, now) {
            Ok(e) => e,
            Err(_) => continue,
        };
        edge.description = addition.description.clone();
        new_edges.push(edge);
        followup_seeds.push(src);
        followup_seeds.push(tgt);
    }
    if !new_edges.is_empty() {
        let inserted = ctx.repo.insert_edges(new_edges).await?;
        outcome.edges_added += inserted.len();
    }

    // Deletes, skipping anything already absorbed by a merge above.
    for delete_temp_id in &parsed.deletes {
        if merged_away.contains(delete_temp_id) {
            continue;
        }
        let Some(node_id) = mapper.resolve(delete_temp_id).cloned() else { continue };
        ctx.repo.delete_node_cascade(&node_id).await?;
        outcome.nodes_deleted += 1;
    }

    followup_seeds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    followup_seeds.dedup();
    Ok(followup_seeds)
}

/// Truncates `label` to at most `limit` bytes, stepping back to the
/// nearest char boundary so a truncation never lands mid-codepoint.
fn truncate_at_char_boundary(label: &mut String, limit: usize) {
    if label.len() <= limit {
        return;
    }
    let cut = label
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    label.truncate(cut);
}

/// `TruncateLongLabels`: clips any label over 255 characters.
pub async fn truncate_long_labels(ctx: &JobContext, user: &UserId) -> Result<usize, JobError> {
    let over_limit = ctx.repo.labels_over_limit(user, LABEL_LIMIT).await;
    let count = over_limit.len();
    for mut metadata in over_limit {
        if let Some(label) = &mut metadata.label {
            truncate_at_char_boundary(label, LABEL_LIMIT);
        }
        ctx.repo.update_node_metadata(metadata).await?;
    }
    Ok(count)
}

/// `GenerateMissingNodeEmbeddings`: backfills embeddings for labeled nodes
/// that don't have one yet (e.g. nodes created outside the normal
/// extraction path, or from an embedding model migration).
pub async fn generate_missing_node_embeddings(ctx: &JobContext, user: &UserId) -> Result<usize, JobError> {
    use slm::clients::EmbeddingKind;

    let missing = ctx.repo.labeled_nodes_without_embedding(user).await;
    let mut count = 0;
    for (node_id, metadata) in missing {
        let Some(label) = metadata.label else { continue };
        let text = match &metadata.description {
            Some(desc) => format!("{label}: {desc}"),
            None => label,
        };
        let vector = ctx.embedder.embed_one(&text, EmbeddingKind::Passage).await.map_err(|e| JobError::Logic(e.to_string()))?;
        if let Ok(embedding) = epigraph_core::model::NodeEmbedding::new(node_id, vector, ctx.model_id.clone()) {
            ctx.repo.insert_node_embedding(embedding).await?;
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;

    #[tokio::test]
    async fn cleanup_merges_two_nodes_into_one() {
        let (ctx, completion, _dir) = test_context().await;
        let user = UserId::new("u1");
        ctx.repo.ensure_user(&user).await.unwrap();

        let a = Node::new(user.clone(), NodeType::Person, 0);
        let a_meta = NodeMetadata::new(a.id.clone()).with_label("Bob".to_string());
        let a_id = ctx.repo.insert_node_with_metadata(a, a_meta).await.unwrap();

        let b = Node::new(user.clone(), NodeType::Person, 0);
        let b_meta = NodeMetadata::new(b.id.clone()).with_label("Bobby".to_string());
        let b_id = ctx.repo.insert_node_with_metadata(b, b_meta).await.unwrap();

        completion.push_response(
            CLEANUP_SCHEMA_NAME,
            serde_json::json!({
                "merges": [{"keep": "temp_person_0", "mergeInto": ["temp_person_0", "temp_person_1"], "label": "Bob"}],
                "deletes": [],
                "additions": [],
                "newNodes": []
            }),
        );

        let outcome = handle_cleanup(
            &ctx,
            CleanupGraphPayload {
                user_id: user.clone(), since: 0, entry_node_limit: 5,
                semantic_neighbor_limit: 15, graph_hop_depth: 1,
                max_subgraph_nodes: 100, max_subgraph_edges: 150,
                llm_model_id: "cleanup-model".to_string(),
                seed_ids: Some(vec![a_id.clone(), b_id.clone()]),
            },
            0,
        )
        .await
        .unwrap();

        assert_eq!(outcome.nodes_merged, 1);
        assert!(ctx.repo.get_node(&b_id).await.is_none());
        assert!(ctx.repo.get_node(&a_id).await.is_some());
    }

    #[tokio::test]
    async fn truncate_long_labels_clips_over_limit_labels() {
        let (ctx, _completion, _dir) = test_context().await;
        let user = UserId::new("u1");
        ctx.repo.ensure_user(&user).await.unwrap();
        let node = Node::new(user.clone(), NodeType::Concept, 0);
        let long_label = "x".repeat(300);
        let metadata = NodeMetadata::new(node.id.clone()).with_label(long_label);
        ctx.repo.insert_node_with_metadata(node, metadata).await.unwrap();

        let truncated = truncate_long_labels(&ctx, &user).await.unwrap();
        assert_eq!(truncated, 1);
    }

    #[tokio::test]
    async fn truncate_long_labels_does_not_panic_on_multibyte_boundary() {
        let (ctx, _completion, _dir) = test_context().await;
        let user = UserId::new("u1");
        ctx.repo.ensure_user(&user).await.unwrap();
        let node = Node::new(user.clone(), NodeType::Concept, 0);
        // "e" repeated up to byte 254 then a 2-byte char straddling byte 255.
        let long_label = format!("{}{}", "e".repeat(254), "é".repeat(23));
        let metadata = NodeMetadata::new(node.id.clone()).with_label(long_label);
        ctx.repo.insert_node_with_metadata(node.clone(), metadata).await.unwrap();

        let truncated = truncate_long_labels(&ctx, &user).await.unwrap();
        assert_eq!(truncated, 1);

        let label = ctx.repo.get_node_metadata(&node.id).await.unwrap().label.unwrap();
        assert!(label.len() <= LABEL_LIMIT);
        assert!(label.is_char_boundary(label.len()));
    }
}
