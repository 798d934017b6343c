pub mod engine;
pub mod semantic_cache;

pub use engine::{
    HybridSearchResult, OneHopEdge, OneHopNode, QueryEngine, QueryError, QueryInput, RankedItem,
    SimilarEdge, SimilarNode, MIN_SIM_CLEANUP, MIN_SIM_DEEP_RESEARCH, MIN_SIM_USER_QUERY,
};
pub use semantic_cache::{EvictionPolicy, SemanticCache, SemanticCacheConfig, SemanticCacheKey};
