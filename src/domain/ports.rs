//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the federation engine depends on. Sources, plugins and the
//! cache's backing document store are all supplied from outside.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Engine                         │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  Source │ PreQueryPlugin │ PostQueryPlugin │ Store   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │         InMemoryDocumentStore │ CacheSource                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::filter::Filter;
use super::types::{Metacard, QueryRequest, QueryResponse, SortBy, SourceResponse};
use crate::error::Result;

// =============================================================================
// Source Port
// =============================================================================

/// A queryable collaborator returning metacards for a request.
///
/// Returning `Error::UnsupportedQuery` or `Error::SourceExecution` is the
/// expected way to report failure; the federation engine turns either into a
/// processing detail on the aggregate response.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable source identifier
    fn id(&self) -> &str;

    /// Whether the source is currently reachable
    async fn is_available(&self) -> bool {
        true
    }

    /// Execute a request against this source
    async fn query(&self, request: &QueryRequest) -> Result<SourceResponse>;
}

// =============================================================================
// Plugin Ports
// =============================================================================

/// Request interceptor run per source, in order, before the source is queried.
///
/// Returning `Error::StopProcessing` skips the remaining pre-query plugins for
/// that source only; any other error is logged and the chain continues with
/// the unchanged request.
#[async_trait]
pub trait PreQueryPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, source: &dyn Source, request: &QueryRequest) -> Result<QueryRequest>;
}

/// Response interceptor run once, in order, on the aggregate response.
///
/// Returning `Error::StopProcessing` skips the remaining post-query plugins.
#[async_trait]
pub trait PostQueryPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, response: &mut QueryResponse) -> Result<()>;
}

// =============================================================================
// Document Store Port
// =============================================================================

/// A metacard as held by the cache's backing store
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDocument {
    pub metacard: Metacard,
    pub cached_at: DateTime<Utc>,
}

impl CachedDocument {
    pub fn new(metacard: Metacard) -> Self {
        Self {
            metacard,
            cached_at: Utc::now(),
        }
    }
}

/// Native query understood by a document store
#[derive(Debug, Clone)]
pub struct StoreQuery {
    pub filter: std::sync::Arc<dyn Filter>,
    /// Restrict to these source ids; empty means all
    pub source_ids: Vec<String>,
    /// 1-based
    pub start_index: usize,
    /// 0 means unbounded
    pub page_size: usize,
    pub sort: Option<SortBy>,
}

/// Page of documents plus the total match count
#[derive(Debug, Clone, Default)]
pub struct StoreQueryResult {
    pub documents: Vec<CachedDocument>,
    pub total_hits: u64,
}

/// Narrow client contract of the external document store backing the cache.
///
/// Writes become visible to `query` only after `commit`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query(&self, query: &StoreQuery) -> Result<StoreQueryResult>;

    /// Upsert keyed by source id + document id
    async fn add(&self, documents: Vec<CachedDocument>) -> Result<()>;

    /// Remove every document whose `attribute` equals one of `values`
    async fn delete_by_attribute(&self, attribute: &str, values: &[serde_json::Value])
        -> Result<u64>;

    /// Remove every document cached before `cutoff`
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn commit(&self) -> Result<()>;
}
