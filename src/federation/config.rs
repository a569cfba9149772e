//! Federation configuration

/// Default clamp for a query's start index
pub const DEFAULT_MAX_START_INDEX: usize = 50_000;

/// Configuration for the federation strategy
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Start indexes above this are clamped to it
    pub max_start_index: usize,

    /// Source queries allowed in flight at once, across all federated calls
    pub max_concurrent_queries: usize,

    /// Background cache-write tasks allowed in flight at once
    pub max_concurrent_cache_writes: usize,

    /// Cache results of requests that do not name a mode
    pub cache_everything: bool,

    /// Mirror remote ingests into the cache
    pub cache_remote_ingests: bool,

    /// Keep error-severity processing details on responses
    pub show_errors: bool,

    /// Keep warning-severity processing details on responses
    pub show_warnings: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_start_index: DEFAULT_MAX_START_INDEX,
            max_concurrent_queries: 64,
            max_concurrent_cache_writes: 8,
            cache_everything: false,
            cache_remote_ingests: false,
            show_errors: true,
            show_warnings: true,
        }
    }
}
