//! Test-only harness shared by the handler test modules: a fresh
//! repository, a deterministic embedder/reranker, a scripted completion
//! client the test drives directly, and an in-memory KV cache/queue.

#![cfg(test)]

use crate::context::JobContext;
use crate::queue::{ChannelJobQueue, Job, JobQueue};
use epigraph_core::kv::{InMemoryKeyValueCache, KeyValueCache};
use ingestion::Extractor;
use query::QueryEngine;
use slm::clients::{DeterministicEmbeddingClient, EmbeddingClient, HeuristicRerankClient, ScriptedCompletionClient};
use std::sync::Arc;
use storage::wal::Wal;
use storage::Repository;
use tokio::sync::Mutex;

pub async fn test_context() -> (JobContext, Arc<ScriptedCompletionClient>, tempfile::TempDir) {
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
    let extractor = Arc::new(Extractor::new(
        repo.clone(),
        query.clone(),
        embedder.clone(),
        completion.clone(),
        "extraction-model-v1",
    ));

    let (sender, mut receiver) = tokio::sync::mpsc::channel::<Job>(64);
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });
    let job_queue: Arc<dyn JobQueue> = Arc::new(ChannelJobQueue::new(sender));

    let ctx = JobContext::new(
        repo,
        query,
        extractor,
        embedder,
        completion.clone(),
        cache,
        job_queue,
        "extraction-model-v1",
        0.1,
        0.4,
    );
    (ctx, completion, dir)
}
