use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub latencies: VecDeque<u64>, // microseconds
}

#[derive(Debug, Clone, Default)]
pub struct SlmMetrics {
    pub total_extractions: u64,
    pub total_confidence: f32,
    pub gpu_vram_usage_mb: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DeepResearchMetrics {
    pub total_loops: u64,
    pub total_iterations: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupMetrics {
    pub total_runs: u64,
    pub nodes_merged: u64,
    pub edges_rewired: u64,
    pub applies: u64,
}

pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    query_metrics: QueryMetrics,
    slm_metrics: SlmMetrics,
    deep_research_metrics: DeepResearchMetrics,
    cleanup_metrics: CleanupMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                query_metrics: QueryMetrics::default(),
                slm_metrics: SlmMetrics::default(),
                deep_research_metrics: DeepResearchMetrics::default(),
                cleanup_metrics: CleanupMetrics::default(),
                max_history,
            })),
        }
    }

    pub fn record_deep_research_loop(&self, iterations: u64, cache_hit: bool) {
        let mut state = self.state.lock().unwrap();
        state.deep_research_metrics.total_loops += 1;
        state.deep_research_metrics.total_iterations += iterations;
        if cache_hit {
            state.deep_research_metrics.cache_hits += 1;
        }
    }

    pub fn record_cleanup_apply(&self, nodes_merged: u64, edges_rewired: u64) {
        let mut state = self.state.lock().unwrap();
        state.cleanup_metrics.total_runs += 1;
        state.cleanup_metrics.nodes_merged += nodes_merged;
        state.cleanup_metrics.edges_rewired += edges_rewired;
        state.cleanup_metrics.applies += 1;
    }

    pub fn record_query(&self, latency_us: u64, is_cache_hit: bool) {
        let mut state = self.state.lock().unwrap();
        state.query_metrics.total_queries += 1;
        if is_cache_hit {
            state.query_metrics.cache_hits += 1;
        }
        state.query_metrics.latencies.push_back(latency_us);
        if state.query_metrics.latencies.len() > state.max_history {
            state.query_metrics.latencies.pop_front();
        }
    }

    pub fn record_slm_extraction(&self, avg_confidence: f32) {
        let mut state = self.state.lock().unwrap();
        state.slm_metrics.total_extractions += 1;
        state.slm_metrics.total_confidence += avg_confidence;
    }

    pub fn set_gpu_usage(&self, vram_mb: u64) {
        let mut state = self.state.lock().unwrap();
        state.slm_metrics.gpu_vram_usage_mb = vram_mb;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        let q = &state.query_metrics;
        let s = &state.slm_metrics;
        
        let mut sorted_latencies: Vec<u64> = q.latencies.iter().copied().collect();
        sorted_latencies.sort_unstable();

        let p50 = percentile(&sorted_latencies, 50.0);
        let p95 = percentile(&sorted_latencies, 95.0);
        let p99 = percentile(&sorted_latencies, 99.0);

        let hit_rate = if q.total_queries > 0 {
            q.cache_hits as f32 / q.total_queries as f32
        } else {
            0.0
        };

        let avg_extraction_confidence = if s.total_extractions > 0 {
            s.total_confidence / s.total_extractions as f32
        } else {
            0.0
        };

        let dr = &state.deep_research_metrics;
        let c = &state.cleanup_metrics;

        MetricsSnapshot {
            total_queries: q.total_queries,
            hit_rate,
            p50,
            p95,
            p99,
            history_count: q.latencies.len(),
            avg_extraction_confidence,
            gpu_vram_usage_mb: s.gpu_vram_usage_mb,
            deep_research_loops: dr.total_loops,
            deep_research_iterations: dr.total_iterations,
            deep_research_cache_hits: dr.cache_hits,
            cleanup_runs: c.total_runs,
            cleanup_nodes_merged: c.nodes_merged,
            cleanup_edges_rewired: c.edges_rewired,
        }
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub hit_rate: f32,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub history_count: usize,
    pub avg_extraction_confidence: f32,
    pub gpu_vram_usage_mb: u64,
    pub deep_research_loops: u64,
    pub deep_research_iterations: u64,
    pub deep_research_cache_hits: u64,
    pub cleanup_runs: u64,
    pub cleanup_nodes_merged: u64,
    pub cleanup_edges_rewired: u64,
}
