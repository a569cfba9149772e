//! Result Cache - write-through store of federated results
//!
//! Wraps the external document store behind a narrow contract. The store
//! client is either `Uninitialized` or `Ready`; every operation goes through
//! the same entry point and reports `CacheUnavailable` until a store is
//! installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::{timer_period, ShutdownSignal};
use crate::domain::{
    CachedDocument, DocumentStore, Metacard, QueryRequest, ResultEntry, SourceResponse,
    StoreQuery,
};
use crate::error::{Error, Result};
use crate::metrics::collectors as metrics;

/// Source id reported on responses answered by the cache
pub const CACHE_SOURCE_ID: &str = "cache";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the result cache
#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    /// How often the expiry task runs
    pub expiration_interval: Duration,

    /// Documents cached longer than this are removed by the expiry task
    pub expiration_age: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            expiration_interval: Duration::from_secs(10 * 60),
            expiration_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

// =============================================================================
// Store State
// =============================================================================

#[derive(Clone)]
enum StoreState {
    Uninitialized,
    Ready(Arc<dyn DocumentStore>),
}

// =============================================================================
// Result Cache
// =============================================================================

/// Write-through result cache
pub struct ResultCache {
    state: RwLock<StoreState>,
    /// Set by writes, cleared by the one caller that wins the commit
    dirty: AtomicBool,
    config: ResultCacheConfig,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("ready", &self.is_ready())
            .field("dirty", &self.is_dirty())
            .field("config", &self.config)
            .finish()
    }
}

impl ResultCache {
    /// Create a cache backed by `store`
    pub fn new(store: Arc<dyn DocumentStore>, config: ResultCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(StoreState::Ready(store)),
            dirty: AtomicBool::new(false),
            config,
            shutdown: ShutdownSignal::default(),
        })
    }

    /// Create a cache with no backing store yet
    pub fn uninitialized(config: ResultCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(StoreState::Uninitialized),
            dirty: AtomicBool::new(false),
            config,
            shutdown: ShutdownSignal::default(),
        })
    }

    /// Install (or replace) the backing store
    pub fn initialize(&self, store: Arc<dyn DocumentStore>) {
        *self.state.write() = StoreState::Ready(store);
        info!("Result cache store initialized");
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read(), StoreState::Ready(_))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ResultCacheConfig {
        &self.config
    }

    fn store(&self) -> Result<Arc<dyn DocumentStore>> {
        match &*self.state.read() {
            StoreState::Ready(store) => Ok(Arc::clone(store)),
            StoreState::Uninitialized => Err(Error::CacheUnavailable),
        }
    }

    /// Answer a request from committed cache contents.
    ///
    /// Scoped to the request's source ids unless the request is enterprise-wide.
    #[instrument(skip(self, request))]
    pub async fn query(&self, request: &QueryRequest) -> Result<SourceResponse> {
        let store = self.store()?;
        let query = request.query();

        let store_query = StoreQuery {
            filter: Arc::clone(query.filter()),
            source_ids: if request.is_enterprise() {
                Vec::new()
            } else {
                request.source_ids().to_vec()
            },
            start_index: query.start_index(),
            page_size: query.page_size(),
            sort: query.sort().cloned(),
        };

        let page = store
            .query(&store_query)
            .await
            .map_err(|e| Error::CacheQuery(e.to_string()))?;

        debug!(
            "Cache query returned {} of {} hits",
            page.documents.len(),
            page.total_hits
        );

        let results = page
            .documents
            .into_iter()
            .map(|doc| ResultEntry::new(doc.metacard))
            .collect();

        Ok(SourceResponse::new(CACHE_SOURCE_ID, results, page.total_hits))
    }

    /// Upsert metacards, skipping any without a complete identity.
    ///
    /// Returns the number of metacards handed to the store.
    pub async fn create(&self, metacards: Vec<Metacard>) -> Result<usize> {
        let store = self.store()?;

        let documents: Vec<CachedDocument> = metacards
            .into_iter()
            .filter(|m| {
                let complete = m.key().is_complete();
                if !complete {
                    debug!("Skipping metacard without identity: {:?}", m.key());
                }
                complete
            })
            .map(CachedDocument::new)
            .collect();

        if documents.is_empty() {
            return Ok(0);
        }

        let count = documents.len();
        store
            .add(documents)
            .await
            .map_err(|e| Error::CacheWrite(e.to_string()))?;
        self.dirty.store(true, Ordering::Release);

        debug!("Cached {} metacards", count);
        Ok(count)
    }

    /// Remove documents whose `attribute` matches one of `values`
    pub async fn delete(&self, attribute: &str, values: &[serde_json::Value]) -> Result<u64> {
        let store = self.store()?;
        let removed = store
            .delete_by_attribute(attribute, values)
            .await
            .map_err(|e| Error::CacheWrite(e.to_string()))?;

        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    /// Commit pending writes if anything changed since the last commit.
    ///
    /// Returns `true` when a commit was issued. Racing callers observe the
    /// dirty flag through one compare-and-swap, so at most one of them commits.
    pub async fn force_commit(&self) -> Result<bool> {
        if self
            .dirty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let outcome = match self.store() {
            Ok(store) => store.commit().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                metrics::record_cache_commit();
                debug!("Cache committed");
                Ok(true)
            }
            Err(e) => {
                // Leave the work for the next commit attempt
                self.dirty.store(true, Ordering::Release);
                Err(Error::CacheWrite(format!("commit failed: {}", e)))
            }
        }
    }

    /// Delete every document older than the configured expiration age
    pub async fn expire(&self) -> Result<u64> {
        let store = self.store()?;
        let age = chrono::Duration::from_std(self.config.expiration_age)
            .map_err(|e| Error::Config(format!("invalid expiration age: {}", e)))?;
        let cutoff = Utc::now() - age;

        let removed = store
            .delete_older_than(cutoff)
            .await
            .map_err(|e| Error::CacheWrite(e.to_string()))?;

        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
            metrics::record_expired(removed);
            info!("Expired {} cached documents older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    /// Spawn the expiry loop
    pub fn start_expiry(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_expiry())
    }

    /// Expiry loop; runs until `shutdown`
    pub async fn run_expiry(self: Arc<Self>) {
        info!(
            "Starting cache expiry every {:?} (age {:?})",
            self.config.expiration_interval, self.config.expiration_age
        );

        let mut tick = interval(timer_period("Cache expiry", self.config.expiration_interval));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.expire().await {
                        warn!("Cache expiry failed: {}", e);
                    }
                }
                _ = self.shutdown.wait() => {
                    info!("Cache expiry shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the expiry loop
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

// =============================================================================
// Tests
// =============================================================================
