//! Throughput/latency probe for the ingest-then-search path: concurrent
//! workers alternate document extraction (write) and hybrid search (read)
//! against one shared `Repository`, mirroring the mixed workload the job
//! worker sees in production.

use epigraph_core::model::{NodeType, UserId};
use ingestion::{Extractor, SourceKind};
use query::QueryEngine;
use serde_json::json;
use slm::clients::{CompletionClient, DeterministicEmbeddingClient, HeuristicRerankClient, ScriptedCompletionClient};
use std::env;
use std::sync::Arc;
use std::time::Instant;
use storage::Repository;
use tokio::sync::Mutex;

const MODEL_ID: &str = "embedding-default-v1";

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse::<usize>().ok()).unwrap_or(default)
}

fn percentile_ns(samples: &[u128], p: f64) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank]
}

fn fmt_ns(ns: u128) -> String {
    if ns >= 1_000_000 {
        format!("{:.3} ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.3} us", ns as f64 / 1_000.0)
    } else {
        format!("{ns} ns")
    }
}

async fn seed_repo(
    repo: &Arc<Repository>,
    extractor: &Extractor,
    completion: &ScriptedCompletionClient,
    user: &UserId,
    node_count: u64,
) {
    repo.ensure_user(user).await.unwrap();
    for id in 1..=node_count {
        completion.push_response(
            ingestion::EXTRACTION_SCHEMA_NAME,
            json!({
                "nodes": [{"id": format!("temp_concept_{id}"), "type": "Concept", "label": format!("topic-{id}"), "description": "EV battery and market context"}],
                "edges": []
            }),
        );
        let linked_node = seed_linked_node(repo, user, id).await;
        extractor
            .extract(user, SourceKind::Document, &linked_node, &format!("seed document {id} about EV batteries"), 1_700_000_000 + id as i64)
            .await
            .unwrap();
    }
}

async fn seed_linked_node(repo: &Arc<Repository>, user: &UserId, id: u64) -> epigraph_core::model::NodeId {
    let source_id = epigraph_core::typeid::TypeId::source();
    repo.ensure_source_node(user, source_id, 1_700_000_000 + id as i64, NodeType::Document).await.unwrap()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let node_count = env_usize("EPIGRAPH_BENCH_NODES", 200) as u64;
    let workers = env_usize("EPIGRAPH_BENCH_WORKERS", 8);
    let ops_per_worker = env_usize("EPIGRAPH_BENCH_OPS_PER_WORKER", 40);
    let write_every = env_usize("EPIGRAPH_BENCH_WRITE_EVERY", 10).max(1);

    let temp_dir = tempfile::tempdir().unwrap();
    let wal_path = temp_dir.path().join("operational_latency_bench.wal");
    let repo = Arc::new(Repository::open(&wal_path).await.unwrap());

    let embedder: Arc<dyn slm::clients::EmbeddingClient> = Arc::new(DeterministicEmbeddingClient::new(MODEL_ID));
    let reranker = Arc::new(HeuristicRerankClient);
    let query = Arc::new(QueryEngine::new(repo.clone(), embedder.clone(), reranker));
    let completion = Arc::new(ScriptedCompletionClient::new());
    let extractor = Arc::new(Extractor::new(repo.clone(), query.clone(), embedder.clone(), completion.clone() as Arc<dyn CompletionClient>, "extraction-bench-v1"));

    let user = UserId::new("bench-user");
    seed_repo(&repo, &extractor, &completion, &user, node_count).await;

    let read_latencies = Arc::new(Mutex::new(Vec::<u128>::new()));
    let write_latencies = Arc::new(Mutex::new(Vec::<u128>::new()));

    let scenario_start = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let repo = repo.clone();
        let query = query.clone();
        let extractor = extractor.clone();
        let completion = completion.clone();
        let user = user.clone();
        let read_latencies = read_latencies.clone();
        let write_latencies = write_latencies.clone();

        let handle = tokio::spawn(async move {
            for op in 0..ops_per_worker {
                if op % write_every == 0 {
                    completion.push_response(
                        ingestion::EXTRACTION_SCHEMA_NAME,
                        json!({
                            "nodes": [{"id": "temp_concept_0", "type": "Concept", "label": format!("runtime-topic-{worker_id}-{op}"), "description": "EV battery expansion"}],
                            "edges": []
                        }),
                    );
                    let source_id = epigraph_core::typeid::TypeId::source();
                    let begin = Instant::now();
                    let linked_node = repo
                        .ensure_source_node(&user, source_id, 1_800_000_000, NodeType::Document)
                        .await
                        .unwrap();
                    extractor
                        .extract(&user, SourceKind::Document, &linked_node, &format!("runtime ingest worker={worker_id} op={op} EV battery expansion."), 1_800_000_000)
                        .await
                        .unwrap();
                    let elapsed = begin.elapsed().as_nanos();
                    write_latencies.lock().await.push(elapsed);
                } else {
                    let begin = Instant::now();
                    let _ = query.hybrid_search(&user, "EV battery market themes", 20, None).await.unwrap();
                    let elapsed = begin.elapsed().as_nanos();
                    read_latencies.lock().await.push(elapsed);
                }
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let total_elapsed = scenario_start.elapsed();
    let read_samples = read_latencies.lock().await.clone();
    let write_samples = write_latencies.lock().await.clone();
    let total_ops = read_samples.len() + write_samples.len();
    let throughput = if total_elapsed.as_secs_f64() > 0.0 {
        total_ops as f64 / total_elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!("=== Operational Latency Benchmark (Extraction + Hybrid Search) ===");
    println!(
        "config: nodes={}, workers={}, ops_per_worker={}, write_every={}",
        node_count, workers, ops_per_worker, write_every
    );
    println!(
        "workload: total_ops={}, read_ops={}, write_ops={}, elapsed={:.3}s, throughput={:.2} ops/s",
        total_ops,
        read_samples.len(),
        write_samples.len(),
        total_elapsed.as_secs_f64(),
        throughput
    );
    println!(
        "read latency: p50={}, p95={}, p99={}",
        fmt_ns(percentile_ns(&read_samples, 0.50)),
        fmt_ns(percentile_ns(&read_samples, 0.95)),
        fmt_ns(percentile_ns(&read_samples, 0.99))
    );
    println!(
        "write latency: p50={}, p95={}, p99={}",
        fmt_ns(percentile_ns(&write_samples, 0.50)),
        fmt_ns(percentile_ns(&write_samples, 0.95)),
        fmt_ns(percentile_ns(&write_samples, 0.99))
    );
}
