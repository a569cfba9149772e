//! Source Query Executor
//!
//! Fans one request out to every source as its own task. Tasks are gated by a
//! shared semaphore so concurrent federated calls cannot exceed the configured
//! number of in-flight source queries.
//!
//! Per source, in order:
//! 1. run the pre-query plugin chain
//! 2. skip the source if it reports itself unavailable
//! 3. query it, recording elapsed time on the response
//! 4. hand its results to the cache according to the request mode

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::cache::{BulkCacheWriter, CommitCoordinator};
use crate::domain::{
    source_elapsed_key, Metacard, PreQueryPlugin, QueryRequest, Source, SourceResponse,
};
use crate::error::{Error, Result};
use crate::metrics::collectors as metrics;

/// Where a source's results go once it answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRoute {
    /// Leave the cache alone
    Skip,
    /// Queue into the bulk writer without waiting
    Background,
    /// Write through the commit coordinator and wait for the commit
    Synchronous,
}

/// A submitted source query
pub struct PendingSource {
    pub source_id: String,
    /// Resolves to `None` when the source was unavailable
    pub handle: JoinHandle<Result<Option<SourceResponse>>>,
    /// Set when a synchronous cache write for this source failed
    pub(crate) index_failed: Arc<AtomicBool>,
}

impl PendingSource {
    pub fn new(
        source_id: impl Into<String>,
        handle: JoinHandle<Result<Option<SourceResponse>>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            handle,
            index_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the source's results could not be written through to the cache
    pub fn index_failed(&self) -> bool {
        self.index_failed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PendingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSource")
            .field("source_id", &self.source_id)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

/// Drop repeated source ids, keeping the first occurrence
pub fn dedupe_sources(sources: &[Arc<dyn Source>]) -> Vec<Arc<dyn Source>> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .filter(|source| {
            let fresh = seen.insert(source.id().to_string());
            if !fresh {
                warn!("Ignoring duplicate source {}", source.id());
            }
            fresh
        })
        .cloned()
        .collect()
}

/// Concurrent per-source dispatcher
pub struct SourceQueryExecutor {
    query_permits: Arc<Semaphore>,
    cache_write_permits: Arc<Semaphore>,
    bulk_writer: Arc<BulkCacheWriter>,
    coordinator: Arc<CommitCoordinator>,
    pre_plugins: Arc<Vec<Arc<dyn PreQueryPlugin>>>,
}

impl SourceQueryExecutor {
    pub fn new(
        max_concurrent_queries: usize,
        max_concurrent_cache_writes: usize,
        bulk_writer: Arc<BulkCacheWriter>,
        coordinator: Arc<CommitCoordinator>,
    ) -> Self {
        Self {
            query_permits: Arc::new(Semaphore::new(max_concurrent_queries.max(1))),
            cache_write_permits: Arc::new(Semaphore::new(max_concurrent_cache_writes.max(1))),
            bulk_writer,
            coordinator,
            pre_plugins: Arc::new(Vec::new()),
        }
    }

    /// Append a pre-query plugin; plugins run in insertion order
    pub fn with_pre_query_plugin(mut self, plugin: Arc<dyn PreQueryPlugin>) -> Self {
        let mut plugins = self.pre_plugins.as_ref().clone();
        plugins.push(plugin);
        self.pre_plugins = Arc::new(plugins);
        self
    }

    /// Submit one task per distinct source
    pub fn execute(
        &self,
        sources: &[Arc<dyn Source>],
        request: &QueryRequest,
        route: CacheRoute,
    ) -> Vec<PendingSource> {
        dedupe_sources(sources)
            .into_iter()
            .map(|source| {
                let source_id = source.id().to_string();
                let span = tracing::debug_span!("source_query", source = %source_id);
                let index_failed = Arc::new(AtomicBool::new(false));
                let handle = tokio::spawn(
                    self.run_source(source, request.clone(), route, Arc::clone(&index_failed))
                        .instrument(span),
                );
                PendingSource {
                    source_id,
                    handle,
                    index_failed,
                }
            })
            .collect()
    }

    fn run_source(
        &self,
        source: Arc<dyn Source>,
        request: QueryRequest,
        route: CacheRoute,
        index_failed: Arc<AtomicBool>,
    ) -> impl std::future::Future<Output = Result<Option<SourceResponse>>> + Send + 'static {
        let permits = Arc::clone(&self.query_permits);
        let plugins = Arc::clone(&self.pre_plugins);
        let cache_writes = Arc::clone(&self.cache_write_permits);
        let bulk_writer = Arc::clone(&self.bulk_writer);
        let coordinator = Arc::clone(&self.coordinator);

        async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("query executor closed".to_string()))?;

            let source_id = source.id().to_string();
            let request = run_pre_plugins(&plugins, source.as_ref(), request).await;

            if !source.is_available().await {
                warn!("Source {} is unavailable, skipping", source_id);
                return Ok(None);
            }

            let started = Instant::now();
            let outcome = source.query(&request).await;
            let elapsed = started.elapsed();
            metrics::observe_source_latency(&source_id, elapsed);

            let mut response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    metrics::record_source_failure(&source_id);
                    debug!("Source {} failed after {:?}: {}", source_id, elapsed, e);
                    return Err(e);
                }
            };

            if response.source_id.is_empty() {
                response.source_id = source_id.clone();
            }
            response.properties.insert(
                source_elapsed_key(&source_id),
                serde_json::Value::from(elapsed.as_millis() as u64),
            );
            debug!(
                "Source {} returned {} results ({} hits) in {:?}",
                source_id,
                response.results.len(),
                response.hits,
                elapsed
            );

            let metacards: Vec<Metacard> =
                response.results.iter().map(|r| r.metacard.clone()).collect();
            if !metacards.is_empty() {
                match route {
                    CacheRoute::Skip => {}
                    CacheRoute::Synchronous => {
                        if let Err(e) = coordinator.add(metacards).await {
                            warn!("Could not index results from {}: {}", source_id, e);
                            index_failed.store(true, Ordering::Release);
                        }
                    }
                    CacheRoute::Background => {
                        tokio::spawn(async move {
                            let Ok(_permit) = cache_writes.acquire_owned().await else {
                                return;
                            };
                            bulk_writer.add(metacards);
                        });
                    }
                }
            }

            Ok(Some(response))
        }
    }
}

/// Run the chain for one source; a stop signal ends the chain for that source only
async fn run_pre_plugins(
    plugins: &[Arc<dyn PreQueryPlugin>],
    source: &dyn Source,
    mut request: QueryRequest,
) -> QueryRequest {
    for plugin in plugins {
        match plugin.process(source, &request).await {
            Ok(next) => request = next,
            Err(Error::StopProcessing { reason, .. }) => {
                debug!(
                    "Pre-query plugin {} stopped processing for {}: {}",
                    plugin.name(),
                    source.id(),
                    reason
                );
                break;
            }
            Err(e) => {
                warn!(
                    "{} (source {})",
                    Error::plugin_failure(plugin.name(), e),
                    source.id()
                );
            }
        }
    }
    request
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryDocumentStore;
    use crate::cache::{
        BulkWriterConfig, CommitCoordinatorConfig, ResultCache, ResultCacheConfig,
    };
    use crate::domain::{match_all, DocumentKey, IdIn, Query};
    use crate::federation::testing::{Behaviour, ScriptedSource};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixture {
        executor: SourceQueryExecutor,
        writer: Arc<BulkCacheWriter>,
        coordinator: Arc<CommitCoordinator>,
        store: Arc<InMemoryDocumentStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cache = ResultCache::new(store.clone(), ResultCacheConfig::default());
        let writer = BulkCacheWriter::new(Arc::clone(&cache), BulkWriterConfig::default());
        let coordinator = CommitCoordinator::new(
            cache,
            CommitCoordinatorConfig {
                advance_period: Duration::from_millis(20),
            },
        );
        let executor =
            SourceQueryExecutor::new(4, 2, Arc::clone(&writer), Arc::clone(&coordinator));
        Fixture {
            executor,
            writer,
            coordinator,
            store,
        }
    }

    fn request() -> QueryRequest {
        QueryRequest::new(Query::new(match_all()))
    }

    async fn resolve(pending: Vec<PendingSource>) -> Vec<(String, Result<Option<SourceResponse>>)> {
        let mut out = Vec::new();
        for p in pending {
            out.push((p.source_id, p.handle.await.unwrap()));
        }
        out
    }

    #[tokio::test]
    async fn test_duplicate_sources_run_once() {
        let fx = fixture();
        let alpha: Arc<ScriptedSource> = Arc::new(ScriptedSource::new("alpha", &[1.0]));
        let beta: Arc<dyn Source> = Arc::new(ScriptedSource::new("beta", &[1.0]));
        let sources: Vec<Arc<dyn Source>> =
            vec![alpha.clone() as Arc<dyn Source>, beta, alpha.clone()];

        let pending = fx.executor.execute(&sources, &request(), CacheRoute::Skip);
        let ids: Vec<&str> = pending.iter().map(|p| p.source_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        resolve(pending).await;
        assert_eq!(alpha.calls(), 1);
    }

    #[tokio::test]
    async fn test_elapsed_time_annotated() {
        let fx = fixture();
        let sources: Vec<Arc<dyn Source>> = vec![Arc::new(
            ScriptedSource::new("slow", &[1.0]).with_delay(Duration::from_millis(30)),
        )];

        let resolved = resolve(fx.executor.execute(&sources, &request(), CacheRoute::Skip)).await;
        let response = resolved[0].1.as_ref().unwrap().as_ref().unwrap();
        assert!(response.elapsed_ms().unwrap() >= 30);
    }

    #[tokio::test]
    async fn test_unavailable_source_is_not_queried() {
        let fx = fixture();
        let down = Arc::new(ScriptedSource::new("down", &[1.0]).with_behaviour(Behaviour::Unavailable));
        let sources: Vec<Arc<dyn Source>> = vec![down.clone()];

        let resolved = resolve(fx.executor.execute(&sources, &request(), CacheRoute::Skip)).await;
        assert!(resolved[0].1.as_ref().unwrap().is_none());
        assert_eq!(down.calls(), 0);
    }

    #[tokio::test]
    async fn test_background_route_fills_backlog() {
        let fx = fixture();
        let sources: Vec<Arc<dyn Source>> = vec![Arc::new(ScriptedSource::new("alpha", &[3.0, 2.0]))];

        resolve(fx.executor.execute(&sources, &request(), CacheRoute::Background)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.writer.backlog_len(), 2);
        assert_eq!(fx.store.committed_len(), 0);
    }

    #[tokio::test]
    async fn test_skip_route_leaves_cache_alone() {
        let fx = fixture();
        let sources: Vec<Arc<dyn Source>> = vec![Arc::new(ScriptedSource::new("alpha", &[3.0]))];

        resolve(fx.executor.execute(&sources, &request(), CacheRoute::Skip)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.writer.backlog_len(), 0);
        assert_eq!(fx.store.add_calls(), 0);
    }

    #[tokio::test]
    async fn test_synchronous_route_commits_before_returning() {
        let fx = fixture();
        let advancer = fx.coordinator.start();
        let sources: Vec<Arc<dyn Source>> = vec![Arc::new(ScriptedSource::new("alpha", &[3.0]))];

        resolve(fx.executor.execute(&sources, &request(), CacheRoute::Synchronous)).await;
        assert!(fx.store.get(&DocumentKey::new("alpha", "alpha-0")).is_some());

        fx.coordinator.shutdown();
        advancer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_synchronous_write_flagged() {
        let fx = fixture();
        fx.store.set_fail_writes(true);
        let sources: Vec<Arc<dyn Source>> = vec![
            Arc::new(ScriptedSource::new("alpha", &[3.0])),
            Arc::new(ScriptedSource::new("empty", &[])),
        ];

        let mut pending = fx.executor.execute(&sources, &request(), CacheRoute::Synchronous);
        for p in pending.iter_mut() {
            let response = (&mut p.handle).await.unwrap().unwrap().unwrap();
            assert_eq!(response.source_id, p.source_id);
        }

        // Only a source with results attempts the write
        assert!(pending[0].index_failed());
        assert!(!pending[1].index_failed());
        assert_eq!(fx.store.committed_len(), 0);
    }

    struct Narrow;

    #[async_trait]
    impl PreQueryPlugin for Narrow {
        fn name(&self) -> &str {
            "narrow"
        }

        async fn process(&self, _source: &dyn Source, request: &QueryRequest) -> Result<QueryRequest> {
            Ok(request.with_added_filter(Arc::new(IdIn::new(["nothing"]))))
        }
    }

    struct Stop;

    #[async_trait]
    impl PreQueryPlugin for Stop {
        fn name(&self) -> &str {
            "stop"
        }

        async fn process(&self, source: &dyn Source, request: &QueryRequest) -> Result<QueryRequest> {
            if source.id() == "alpha" {
                return Err(Error::StopProcessing {
                    plugin: "stop".into(),
                    reason: "alpha is exempt".into(),
                });
            }
            Ok(request.clone())
        }
    }

    #[tokio::test]
    async fn test_stop_processing_only_affects_one_source() {
        let fx = fixture();
        let executor = fx
            .executor
            .with_pre_query_plugin(Arc::new(Stop))
            .with_pre_query_plugin(Arc::new(Narrow));

        let alpha = Arc::new(ScriptedSource::new("alpha", &[1.0]));
        let beta = Arc::new(ScriptedSource::new("beta", &[1.0]));
        let sources: Vec<Arc<dyn Source>> = vec![alpha.clone(), beta.clone()];
        resolve(executor.execute(&sources, &request(), CacheRoute::Skip)).await;

        let probe = crate::domain::Metacard::new("x", "alpha");
        // alpha skipped Narrow, beta did not
        assert!(alpha.last_request().unwrap().query().filter().matches(&probe));
        assert!(!beta.last_request().unwrap().query().filter().matches(&probe));
    }
}
