//! fedcache Integration Tests
//!
//! Exercises the public API end to end:
//! - Federation: fan-out, merge, offset compensation, deadlines, interruption
//! - Cache: phased commit visibility, backlog behaviour, commit idempotence

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fedcache::adapters::InMemoryDocumentStore;
use fedcache::cache::{
    BulkCacheWriter, BulkWriterConfig, CommitCoordinator, CommitCoordinatorConfig, ResultCache,
    ResultCacheConfig,
};
use fedcache::domain::{
    match_all, DetailKind, Metacard, Query, QueryMode, QueryRequest, ResultEntry, Source,
    SourceResponse,
};
use fedcache::error::Result;
use fedcache::federation::{FederationConfig, FederationStrategy};

// =============================================================================
// Test Support
// =============================================================================

/// Source answering from a fixed, locally ordered result list
struct ListSource {
    id: String,
    results: Vec<ResultEntry>,
    delay: Duration,
}

impl ListSource {
    fn scored(id: &str, scores: &[f64]) -> Self {
        let results = scores
            .iter()
            .enumerate()
            .map(|(i, score)| {
                ResultEntry::new(Metacard::new(format!("{}-{}", id, i), id)).with_relevance(*score)
            })
            .collect();
        Self {
            id: id.to_string(),
            results,
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Source for ListSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(&self, request: &QueryRequest) -> Result<SourceResponse> {
        tokio::time::sleep(self.delay).await;

        let query = request.query();
        let take = if query.page_size() == 0 {
            usize::MAX
        } else {
            query.page_size()
        };
        let page = self
            .results
            .iter()
            .skip(query.start_index() - 1)
            .take(take)
            .cloned()
            .collect();
        Ok(SourceResponse::new(
            self.id.clone(),
            page,
            self.results.len() as u64,
        ))
    }
}

struct Harness {
    strategy: FederationStrategy,
    store: Arc<InMemoryDocumentStore>,
}

fn harness(commit_period: Duration) -> Harness {
    let store = Arc::new(InMemoryDocumentStore::new());
    let cache = ResultCache::new(store.clone(), ResultCacheConfig::default());
    let writer = BulkCacheWriter::new(Arc::clone(&cache), BulkWriterConfig::default());
    let coordinator = CommitCoordinator::new(
        Arc::clone(&cache),
        CommitCoordinatorConfig {
            advance_period: commit_period,
        },
    );
    Harness {
        strategy: FederationStrategy::new(cache, writer, coordinator, FederationConfig::default()),
        store,
    }
}

fn three_sources() -> Vec<Arc<dyn Source>> {
    ["x", "y", "z"]
        .iter()
        .map(|id| Arc::new(ListSource::scored(id, &[9.0, 7.0, 5.0, 3.0, 1.0])) as Arc<dyn Source>)
        .collect()
}

fn relevances(entries: &[ResultEntry]) -> Vec<f64> {
    entries.iter().filter_map(|r| r.relevance).collect()
}

// =============================================================================
// Federation Scenarios
// =============================================================================

mod federation_tests {
    use super::*;

    #[tokio::test]
    async fn test_three_sources_merge_sorted() {
        let h = harness(Duration::from_secs(1));
        let request = QueryRequest::new(Query::new(match_all()).with_page_size(10));

        let response = h.strategy.federate(&three_sources(), &request).await.unwrap();

        // Each source returns its top 10 (all 5); merged and truncated to 10
        assert_eq!(response.hits, 15);
        assert_eq!(response.results.len(), 10);
        let scores = relevances(&response.results);
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(&scores[..3], &[9.0, 9.0, 9.0]);
    }

    #[tokio::test]
    async fn test_three_sources_unbounded_page_returns_all() {
        let h = harness(Duration::from_secs(1));
        let request = QueryRequest::new(Query::new(match_all()).with_page_size(15));

        let response = h.strategy.federate(&three_sources(), &request).await.unwrap();
        assert_eq!(response.results.len(), 15);
        assert_eq!(response.hits, 15);
        assert_eq!(
            relevances(&response.results),
            vec![9.0, 9.0, 9.0, 7.0, 7.0, 7.0, 5.0, 5.0, 5.0, 3.0, 3.0, 3.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(response.hits_per_source.get("y"), Some(&5));
    }

    #[tokio::test]
    async fn test_offset_page_matches_full_merge() {
        let h = harness(Duration::from_secs(1));
        let full = h
            .strategy
            .federate(
                &three_sources(),
                &QueryRequest::new(Query::new(match_all()).with_page_size(15)),
            )
            .await
            .unwrap();

        let request = QueryRequest::new(Query::new(match_all()).with_start_index(6).with_page_size(5));
        let page = h.strategy.federate(&three_sources(), &request).await.unwrap();

        assert_eq!(page.results, full.results[5..10].to_vec());
        assert_eq!(page.hits, 15);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let h = harness(Duration::from_secs(1));
        let fast = Arc::new(ListSource::scored("x", &[4.0, 2.0]).with_delay(Duration::from_millis(10)));
        let slow = Arc::new(ListSource::scored("y", &[8.0]).with_delay(Duration::from_secs(10)));
        let sources: Vec<Arc<dyn Source>> = vec![fast as Arc<dyn Source>, slow];

        let request = QueryRequest::new(Query::new(match_all()).with_timeout_ms(50));
        let started = tokio::time::Instant::now();
        let response = h.strategy.federate(&sources, &request).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(response.result_ids(), vec!["x-0", "x-1"]);
        assert_eq!(response.hits, 2);
        assert_eq!(response.processing_details.len(), 1);
        assert_eq!(response.processing_details[0].source_id, "y");
        assert_eq!(response.processing_details[0].kind, DetailKind::Timeout);
    }

    #[tokio::test]
    async fn test_timeouts_counted_per_outstanding_source() {
        let h = harness(Duration::from_secs(1));
        let mut sources: Vec<Arc<dyn Source>> = Vec::new();
        for i in 0..3 {
            sources.push(Arc::new(ListSource::scored(&format!("ok{}", i), &[1.0, 1.0])));
        }
        for i in 0..4 {
            sources.push(Arc::new(
                ListSource::scored(&format!("slow{}", i), &[1.0]).with_delay(Duration::from_secs(30)),
            ));
        }

        let request = QueryRequest::new(Query::new(match_all()).with_timeout_ms(100));
        let response = h.strategy.federate(&sources, &request).await.unwrap();

        assert_eq!(response.results.len(), 6);
        assert_eq!(response.hits, 6);
        let timeouts = response
            .processing_details
            .iter()
            .filter(|d| d.kind == DetailKind::Timeout)
            .count();
        assert_eq!(timeouts, 4);
    }

    #[tokio::test]
    async fn test_interrupt_stops_merge() {
        let h = harness(Duration::from_secs(1));
        let sources: Vec<Arc<dyn Source>> = vec![
            Arc::new(ListSource::scored("x", &[1.0])) as Arc<dyn Source>,
            Arc::new(ListSource::scored("y", &[1.0]).with_delay(Duration::from_secs(30))),
        ];
        let request = QueryRequest::new(Query::new(match_all()).with_timeout_ms(0));

        let interrupt = fedcache::InterruptHandle::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.interrupt();
        });

        let response = h
            .strategy
            .federate_with_interrupt(&sources, &request, interrupt)
            .await
            .unwrap();
        assert_eq!(response.result_ids(), vec!["x-0"]);
        assert_eq!(response.details_for("y")[0].kind, DetailKind::Interrupted);
    }

    #[tokio::test]
    async fn test_no_sources_yields_empty_response() {
        let h = harness(Duration::from_secs(1));
        let request = QueryRequest::new(Query::new(match_all()));

        let response = h.strategy.federate(&[], &request).await.unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.hits, 0);
        assert!(!response.request_id.is_empty());
    }
}

// =============================================================================
// Cache Properties
// =============================================================================

mod cache_tests {
    use super::*;
    use fedcache::domain::{DocumentKey, DocumentStore};

    #[tokio::test]
    async fn test_phased_add_visible_on_return() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cache = ResultCache::new(store.clone(), ResultCacheConfig::default());
        let coordinator = CommitCoordinator::new(
            Arc::clone(&cache),
            CommitCoordinatorConfig {
                advance_period: Duration::from_millis(50),
            },
        );
        let advancer = coordinator.start();

        for i in 0..5 {
            let id = format!("doc-{}", i);
            coordinator
                .add(vec![Metacard::new(id.clone(), "alpha")])
                .await
                .unwrap();

            let request = QueryRequest::new(Query::new(Arc::new(fedcache::domain::IdIn::new([id]))));
            assert_eq!(cache.query(&request).await.unwrap().hits, 1);
        }

        coordinator.shutdown();
        advancer.await.unwrap();
    }

    #[tokio::test]
    async fn test_index_mode_read_your_write() {
        let h = harness(Duration::from_millis(30));
        let advancer = h.strategy.coordinator().start();

        let request = QueryRequest::new(Query::new(match_all()).with_page_size(0))
            .with_mode(QueryMode::Index);
        let response = h.strategy.federate(&three_sources(), &request).await.unwrap();
        assert_eq!(response.results.len(), 15);

        let cached = QueryRequest::new(Query::new(match_all()).with_page_size(0))
            .with_mode(QueryMode::Cache);
        let response = h.strategy.federate(&[], &cached).await.unwrap();
        assert_eq!(response.hits, 15);

        h.strategy.shutdown().await;
        advancer.await.unwrap();
    }

    #[tokio::test]
    async fn test_update_mode_caches_in_background() {
        let h = harness(Duration::from_secs(1));
        let request = QueryRequest::new(Query::new(match_all())).with_mode(QueryMode::Update);

        let response = h.strategy.federate(&three_sources(), &request).await.unwrap();
        assert_eq!(response.results.len(), 10);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.committed_len(), 0);

        h.strategy.bulk_writer().flush().await.unwrap();
        // Each source returned all 5 of its results
        assert_eq!(h.store.committed_len(), 15);
    }

    #[tokio::test]
    async fn test_backlog_last_write_wins() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cache = ResultCache::new(store.clone(), ResultCacheConfig::default());
        let writer = BulkCacheWriter::new(cache, BulkWriterConfig::default());

        writer.add(vec![Metacard::new("a", "alpha").with_title("stale")]);
        writer.add(vec![Metacard::new("a", "alpha").with_title("fresh")]);
        writer.flush().await.unwrap();

        assert_eq!(store.documents_written(), 1);
        let cached = store.get(&DocumentKey::new("alpha", "a")).unwrap();
        assert_eq!(cached.metacard.title.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_backlog_bound_holds() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cache = ResultCache::new(store, ResultCacheConfig::default());
        let writer = BulkCacheWriter::new(
            cache,
            BulkWriterConfig {
                maximum_backlog_size: 10,
                ..Default::default()
            },
        );

        let batch = |prefix: &str| -> Vec<Metacard> {
            (0..10)
                .map(|i| Metacard::new(format!("{}-{}", prefix, i), "alpha"))
                .collect()
        };
        assert!(writer.add(batch("first")));
        assert_eq!(writer.backlog_len(), 10);

        for round in 0..5 {
            assert!(!writer.add(batch(&format!("extra{}", round))));
            assert_eq!(writer.backlog_len(), 10);
        }
        assert_eq!(writer.snapshot().dropped, 50);
    }

    #[tokio::test]
    async fn test_force_commit_idempotent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cache = ResultCache::new(store.clone(), ResultCacheConfig::default());

        cache.create(vec![Metacard::new("a", "alpha")]).await.unwrap();
        assert!(cache.force_commit().await.unwrap());
        assert!(!cache.force_commit().await.unwrap());
        assert_eq!(store.commit_count(), 1);

        // A direct store write does not mark the cache dirty
        store
            .add(vec![fedcache::domain::CachedDocument::new(Metacard::new("b", "alpha"))])
            .await
            .unwrap();
        assert!(!cache.force_commit().await.unwrap());
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_outage_never_fails_queries() {
        let h = harness(Duration::from_millis(20));
        let advancer = h.strategy.coordinator().start();
        h.store.set_fail_writes(true);

        let request = QueryRequest::new(Query::new(match_all())).with_mode(QueryMode::Index);
        let response = h.strategy.federate(&three_sources(), &request).await.unwrap();

        // Writes never reached the cache, so the page comes from the sources
        assert!(response.processing_details.is_empty());
        assert_eq!(response.hits, 15);
        assert_eq!(response.results.len(), 10);
        let scores = relevances(&response.results);
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));

        h.strategy.shutdown().await;
        advancer.await.unwrap();
    }
}

// =============================================================================
// Phase Barrier
// =============================================================================

mod barrier_tests {
    use super::*;
    use fedcache::PhaseBarrier;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[tokio::test]
    async fn test_waiter_released_by_last_arrival() {
        let barrier = PhaseBarrier::new();
        let phase = barrier.register().await.unwrap();
        barrier.register().await.unwrap();

        barrier.arrive().await.unwrap();
        let mut waiter = task::spawn(barrier.await_advance(phase));
        assert_pending!(waiter.poll());

        barrier.arrive().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(waiter.is_woken());
        let next = assert_ready_ok!(waiter.poll());
        assert_eq!(next, phase + 1);
        assert_eq!(barrier.unarrived_parties(), 2);
    }

    #[tokio::test]
    async fn test_dropped_party_does_not_stall_phase() {
        let barrier = PhaseBarrier::new();
        let phase = barrier.register().await.unwrap();

        {
            let _party = barrier.join().await.unwrap();
        }

        barrier.arrive().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), barrier.await_advance(phase))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, phase + 1);
        assert_eq!(barrier.registered_parties(), 1);
    }
}
