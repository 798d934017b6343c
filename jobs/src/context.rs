//! Dependency-injected handles shared by every job handler. Constructed
//! once at worker startup and cloned (cheaply — everything is an `Arc`)
//! into each job's handling.

use epigraph_core::kv::KeyValueCache;
use ingestion::Extractor;
use query::QueryEngine;
use slm::clients::{CompletionClient, EmbeddingClient};
use std::sync::Arc;
use storage::Repository;

use crate::queue::JobQueue;

#[derive(Clone)]
pub struct JobContext {
    pub repo: Arc<Repository>,
    pub query: Arc<QueryEngine>,
    pub extractor: Arc<Extractor>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub completion: Arc<dyn CompletionClient>,
    pub cache: Arc<dyn KeyValueCache>,
    pub job_queue: Arc<dyn JobQueue>,
    pub model_id: String,
    pub dream_probability: f64,
    pub dream_selection_probability: f64,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<Repository>,
        query: Arc<QueryEngine>,
        extractor: Arc<Extractor>,
        embedder: Arc<dyn EmbeddingClient>,
        completion: Arc<dyn CompletionClient>,
        cache: Arc<dyn KeyValueCache>,
        job_queue: Arc<dyn JobQueue>,
        model_id: impl Into<String>,
        dream_probability: f64,
        dream_selection_probability: f64,
    ) -> Self {
        Self {
            repo,
            query,
            extractor,
            embedder,
            completion,
            cache,
            job_queue,
            model_id: model_id.into(),
            dream_probability,
            dream_selection_probability,
        }
    }
}
