//! Error types for the caching federation engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while federating queries or maintaining the cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Query Errors
    // =========================================================================
    /// Query violates the query invariants
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A source cannot execute the filter it was given
    #[error("Unsupported query for source {source_id}: {reason}")]
    UnsupportedQuery { source_id: String, reason: String },

    /// A source did not answer before the query deadline
    #[error("Source {source_id} timed out after {elapsed_ms}ms")]
    SourceTimeout { source_id: String, elapsed_ms: u64 },

    /// A source raised an error while executing
    #[error("Source {source_id} failed: {reason}")]
    SourceExecution { source_id: String, reason: String },

    /// The merge wait was interrupted
    #[error("Interrupted while waiting on source {source_id}")]
    Interrupted { source_id: String },

    // =========================================================================
    // Plugin Errors
    // =========================================================================
    /// Plugin failed; the chain continues with the next plugin
    #[error("Plugin {plugin} failed: {reason}")]
    PluginExecution { plugin: String, reason: String },

    /// Plugin asked to stop processing the rest of its chain
    #[error("Plugin {plugin} stopped processing: {reason}")]
    StopProcessing { plugin: String, reason: String },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Writing to or committing the cache failed
    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    /// Reading from the cache failed
    #[error("Cache query failed: {0}")]
    CacheQuery(String),

    /// Cache has no backing store yet
    #[error("Cache store is not initialized")]
    CacheUnavailable,

    /// Phase barrier was terminated while a party was waiting on it
    #[error("Commit barrier terminated at phase {phase}")]
    BarrierTerminated { phase: u64 },

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Source id this error is attributed to, if any
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Error::UnsupportedQuery { source_id, .. }
            | Error::SourceTimeout { source_id, .. }
            | Error::SourceExecution { source_id, .. }
            | Error::Interrupted { source_id } => Some(source_id),
            _ => None,
        }
    }

    /// Attribute a plugin error to `plugin`; stop signals pass through unchanged
    pub fn plugin_failure(plugin: &str, err: Error) -> Error {
        match err {
            Error::StopProcessing { .. } | Error::PluginExecution { .. } => err,
            other => Error::PluginExecution {
                plugin: plugin.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Whether this error belongs to the cache subsystem
    pub fn is_cache_error(&self) -> bool {
        matches!(
            self,
            Error::CacheWrite(_)
                | Error::CacheQuery(_)
                | Error::CacheUnavailable
                | Error::BarrierTerminated { .. }
        )
    }
}
