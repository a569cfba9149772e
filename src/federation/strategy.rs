//! Federation Strategy
//!
//! Public entry point of the engine. Picks the cache-only or live path for a
//! request and wires the executor, monitor and offset compensation together.
//!
//! ```text
//!   federate(sources, request)
//!     │ validate, clamp start index
//!     ├── mode=cache ──► CacheSource ─────────────────┐
//!     └── otherwise ───► OffsetPlan ──► executor ──►  │
//!                         (inflate)     per source    │
//!                                          │          ▼
//!                                          └──► SortedQueryMonitor
//!                                                     │ window (unless cache re-read)
//!                                                     ▼
//!                                   detail visibility ──► post-query plugins
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

use super::config::FederationConfig;
use super::executor::{dedupe_sources, CacheRoute, SourceQueryExecutor};
use super::monitor::{InterruptHandle, MergeOrigin, SortedQueryMonitor};
use super::offset::OffsetPlan;
use crate::adapters::CacheSource;
use crate::cache::{BulkCacheWriter, CommitCoordinator, ResultCache};
use crate::domain::{
    Metacard, PostQueryPlugin, PreQueryPlugin, QueryMode, QueryRequest, QueryResponse, Severity,
    Source,
};
use crate::error::{Error, Result};
use crate::metrics::collectors as metrics;

/// Caching federation strategy
pub struct FederationStrategy {
    cache: Arc<ResultCache>,
    bulk_writer: Arc<BulkCacheWriter>,
    coordinator: Arc<CommitCoordinator>,
    executor: SourceQueryExecutor,
    cache_source: Arc<dyn Source>,
    post_plugins: Vec<Arc<dyn PostQueryPlugin>>,

    max_start_index: AtomicUsize,
    cache_everything: AtomicBool,
    cache_remote_ingests: AtomicBool,
    show_errors: AtomicBool,
    show_warnings: AtomicBool,
}

impl FederationStrategy {
    pub fn new(
        cache: Arc<ResultCache>,
        bulk_writer: Arc<BulkCacheWriter>,
        coordinator: Arc<CommitCoordinator>,
        config: FederationConfig,
    ) -> Self {
        let executor = SourceQueryExecutor::new(
            config.max_concurrent_queries,
            config.max_concurrent_cache_writes,
            Arc::clone(&bulk_writer),
            Arc::clone(&coordinator),
        );

        Self {
            cache_source: Arc::new(CacheSource::new(Arc::clone(&cache))),
            cache,
            bulk_writer,
            coordinator,
            executor,
            post_plugins: Vec::new(),
            max_start_index: AtomicUsize::new(config.max_start_index),
            cache_everything: AtomicBool::new(config.cache_everything),
            cache_remote_ingests: AtomicBool::new(config.cache_remote_ingests),
            show_errors: AtomicBool::new(config.show_errors),
            show_warnings: AtomicBool::new(config.show_warnings),
        }
    }

    /// Append a pre-query plugin; plugins run per source in insertion order
    pub fn with_pre_query_plugin(mut self, plugin: Arc<dyn PreQueryPlugin>) -> Self {
        self.executor = self.executor.with_pre_query_plugin(plugin);
        self
    }

    /// Append a post-query plugin; plugins run once per response in insertion order
    pub fn with_post_query_plugin(mut self, plugin: Arc<dyn PostQueryPlugin>) -> Self {
        self.post_plugins.push(plugin);
        self
    }

    // =========================================================================
    // Runtime settings
    // =========================================================================

    pub fn set_max_start_index(&self, max: usize) {
        self.max_start_index.store(max.max(1), Ordering::Relaxed);
    }

    pub fn set_cache_everything(&self, enabled: bool) {
        self.cache_everything.store(enabled, Ordering::Relaxed);
    }

    pub fn set_cache_remote_ingests(&self, enabled: bool) {
        self.cache_remote_ingests.store(enabled, Ordering::Relaxed);
    }

    pub fn set_show_errors(&self, enabled: bool) {
        self.show_errors.store(enabled, Ordering::Relaxed);
    }

    pub fn set_show_warnings(&self, enabled: bool) {
        self.show_warnings.store(enabled, Ordering::Relaxed);
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn bulk_writer(&self) -> &Arc<BulkCacheWriter> {
        &self.bulk_writer
    }

    pub fn coordinator(&self) -> &Arc<CommitCoordinator> {
        &self.coordinator
    }

    // =========================================================================
    // Federation
    // =========================================================================

    /// Federate `request` across `sources`.
    ///
    /// Source failures degrade the response with processing details; the only
    /// error returned is `InvalidQuery`.
    pub async fn federate(
        &self,
        sources: &[Arc<dyn Source>],
        request: &QueryRequest,
    ) -> Result<QueryResponse> {
        self.federate_with_interrupt(sources, request, InterruptHandle::new())
            .await
    }

    /// `federate`, stopping the merge early if `interrupt` fires
    #[instrument(
        skip(self, sources, request, interrupt),
        fields(request_id = tracing::field::Empty, mode = tracing::field::Empty)
    )]
    pub async fn federate_with_interrupt(
        &self,
        sources: &[Arc<dyn Source>],
        request: &QueryRequest,
        interrupt: InterruptHandle,
    ) -> Result<QueryResponse> {
        let request_id = Uuid::new_v4().to_string();
        let mode_label = request
            .mode()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "default".to_string());
        Span::current().record("request_id", request_id.as_str());
        Span::current().record("mode", mode_label.as_str());

        request.query().validate()?;
        let request = self.clamp_start_index(request);
        metrics::record_federated_query(&mode_label);

        let mut response = match request.mode() {
            Some(QueryMode::Cache) => {
                self.query_cache(&request_id, &request, interrupt).await
            }
            _ => {
                self.query_sources(&request_id, sources, &request, interrupt)
                    .await
            }
        };

        self.apply_detail_visibility(&mut response);
        self.run_post_plugins(&mut response).await;

        debug!(
            "Federated query returned {} of {} hits with {} details",
            response.results.len(),
            response.hits,
            response.processing_details.len()
        );
        Ok(response)
    }

    async fn query_cache(
        &self,
        request_id: &str,
        request: &QueryRequest,
        interrupt: InterruptHandle,
    ) -> QueryResponse {
        let sources = [Arc::clone(&self.cache_source)];
        let pending = self.executor.execute(&sources, request, CacheRoute::Skip);
        let (response, _) = SortedQueryMonitor::new(request.clone(), interrupt)
            .collect(request_id, pending)
            .await;
        response
    }

    async fn query_sources(
        &self,
        request_id: &str,
        sources: &[Arc<dyn Source>],
        request: &QueryRequest,
        interrupt: InterruptHandle,
    ) -> QueryResponse {
        let sources = dedupe_sources(sources);
        let plan = OffsetPlan::for_query(request.query(), sources.len());
        let outgoing = if plan.is_compensated() {
            request.with_query(plan.source_query(request.query()))
        } else {
            request.clone()
        };

        let route = self.cache_route(request.mode());
        let pending = self.executor.execute(&sources, &outgoing, route);

        let mut monitor = SortedQueryMonitor::new(outgoing, interrupt);
        if route == CacheRoute::Synchronous {
            monitor = monitor.with_cache_reread(Arc::clone(&self.cache), request.clone());
        }

        match monitor.collect(request_id, pending).await {
            (response, MergeOrigin::Cache) => response,
            (response, MergeOrigin::Sources) => plan.apply(response),
        }
    }

    fn cache_route(&self, mode: Option<QueryMode>) -> CacheRoute {
        match mode {
            Some(QueryMode::Index) => CacheRoute::Synchronous,
            Some(QueryMode::Update) => CacheRoute::Background,
            Some(QueryMode::Native) | Some(QueryMode::Cache) => CacheRoute::Skip,
            None if self.cache_everything.load(Ordering::Relaxed) => CacheRoute::Background,
            None => CacheRoute::Skip,
        }
    }

    fn clamp_start_index(&self, request: &QueryRequest) -> QueryRequest {
        let max = self.max_start_index.load(Ordering::Relaxed);
        let start = request.query().start_index();
        if start <= max {
            return request.clone();
        }

        debug!("Clamping start index {} to {}", start, max);
        request.with_query(request.query().clone().with_start_index(max))
    }

    fn apply_detail_visibility(&self, response: &mut QueryResponse) {
        let show_errors = self.show_errors.load(Ordering::Relaxed);
        let show_warnings = self.show_warnings.load(Ordering::Relaxed);
        if show_errors && show_warnings {
            return;
        }

        response.processing_details.retain(|detail| {
            let visible = match detail.severity {
                Severity::Error => show_errors,
                Severity::Warning => show_warnings,
            };
            if !visible {
                debug!(
                    "Hiding {:?} detail for {}: {}",
                    detail.kind, detail.source_id, detail.message
                );
            }
            visible
        });
    }

    async fn run_post_plugins(&self, response: &mut QueryResponse) {
        for plugin in &self.post_plugins {
            match plugin.process(response).await {
                Ok(()) => {}
                Err(Error::StopProcessing { reason, .. }) => {
                    debug!("Post-query plugin {} stopped processing: {}", plugin.name(), reason);
                    break;
                }
                Err(e) => warn!("{}", Error::plugin_failure(plugin.name(), e)),
            }
        }
    }

    // =========================================================================
    // Remote ingest and lifecycle
    // =========================================================================

    /// Mirror a remote ingest into the cache when remote-ingest caching is on.
    ///
    /// Created or updated metacards go through the bulk writer; deleted ids are
    /// removed from the cache directly. Failures are logged, never returned.
    pub async fn cache_remote_ingest(&self, created: Vec<Metacard>, deleted_ids: &[String]) {
        if !self.cache_remote_ingests.load(Ordering::Relaxed) {
            return;
        }

        if !created.is_empty() && !self.bulk_writer.add(created) {
            debug!("Remote ingest results dropped, cache backlog is full");
        }

        if !deleted_ids.is_empty() {
            let values: Vec<serde_json::Value> = deleted_ids
                .iter()
                .map(|id| serde_json::Value::String(id.clone()))
                .collect();
            match self.cache.delete("id", &values).await {
                Ok(removed) => debug!("Removed {} remotely deleted documents from cache", removed),
                Err(e) => warn!("Could not remove remotely deleted documents from cache: {}", e),
            }
        }
    }

    /// Flush the backlog, release index-mode waiters and stop every timer
    pub async fn shutdown(&self) {
        info!("Shutting down federation strategy");
        self.bulk_writer.shutdown().await;
        self.coordinator.shutdown();
        self.cache.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================
