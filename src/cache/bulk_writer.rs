//! Bulk Cache Writer
//!
//! Fire-and-forget write path for update-mode results. Results are held in a
//! bounded backlog keyed by source id + document id and written to the cache
//! in batches by a periodic flusher.
//!
//! - A newer copy of a document replaces the older one while both wait.
//! - A batch that would push the backlog past its cap is dropped whole.
//! - A batch that fails to write stays in the backlog for the next flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::result_cache::ResultCache;
use super::{timer_period, ShutdownSignal};
use crate::domain::{DocumentKey, Metacard};
use crate::error::Result;
use crate::metrics::collectors as metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the bulk cache writer
#[derive(Debug, Clone)]
pub struct BulkWriterConfig {
    /// How often the flusher wakes up
    pub tick_interval: Duration,

    /// Minimum time between flushes
    pub flush_interval: Duration,

    /// Maximum documents per cache write
    pub batch_size: usize,

    /// Backlog cap; additions are rejected at or above it
    pub maximum_backlog_size: usize,
}

impl Default for BulkWriterConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(10),
            batch_size: 500,
            maximum_backlog_size: 10_000,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct WriterStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    failed_batches: AtomicU64,
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriterSnapshot {
    /// Metacards accepted into the backlog
    pub accepted: u64,
    /// Metacards rejected because the backlog was full
    pub dropped: u64,
    /// Metacards written to the cache
    pub flushed: u64,
    pub failed_batches: u64,
    pub backlog: usize,
}

#[derive(Debug, Clone)]
struct BacklogEntry {
    metacard: Metacard,
    version: u64,
}

// =============================================================================
// Bulk Writer
// =============================================================================

/// Backlogged batch writer in front of the result cache
pub struct BulkCacheWriter {
    cache: Arc<ResultCache>,
    config: BulkWriterConfig,
    backlog: DashMap<DocumentKey, BacklogEntry>,
    next_version: AtomicU64,
    last_flush: Mutex<Instant>,
    /// Serializes flushes
    flush_lock: tokio::sync::Mutex<()>,
    stats: WriterStats,
    shutdown: ShutdownSignal,
}

impl BulkCacheWriter {
    pub fn new(cache: Arc<ResultCache>, config: BulkWriterConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            config,
            backlog: DashMap::new(),
            next_version: AtomicU64::new(0),
            last_flush: Mutex::new(Instant::now()),
            flush_lock: tokio::sync::Mutex::new(()),
            stats: WriterStats::default(),
            shutdown: ShutdownSignal::default(),
        })
    }

    /// Queue metacards for the next flush.
    ///
    /// Returns `false` and drops the whole batch when the backlog is full.
    pub fn add(&self, metacards: impl IntoIterator<Item = Metacard>) -> bool {
        let metacards: Vec<Metacard> = metacards.into_iter().collect();

        if self.backlog.len() >= self.config.maximum_backlog_size {
            self.stats
                .dropped
                .fetch_add(metacards.len() as u64, Ordering::Relaxed);
            metrics::record_backlog_dropped(metacards.len());
            debug!(
                "Cache backlog full ({} entries), dropping {} results",
                self.backlog.len(),
                metacards.len()
            );
            return false;
        }

        let mut accepted = 0u64;
        for metacard in metacards {
            let key = metacard.key();
            if !key.is_complete() {
                debug!("Skipping metacard without identity: {:?}", key);
                continue;
            }
            let version = self.next_version.fetch_add(1, Ordering::Relaxed);
            self.backlog.insert(key, BacklogEntry { metacard, version });
            accepted += 1;
        }

        self.stats.accepted.fetch_add(accepted, Ordering::Relaxed);
        metrics::set_backlog_size(self.backlog.len());
        true
    }

    /// Flush when a full batch is waiting or the flush interval has elapsed
    pub async fn flush_if_due(&self) -> Result<usize> {
        let since_last = self.last_flush.lock().elapsed();
        let batch_ready = self.backlog.len() >= self.config.batch_size;
        if !batch_ready && since_last < self.config.flush_interval {
            return Ok(0);
        }
        self.flush().await
    }

    /// Write the backlog to the cache in batches, then commit.
    ///
    /// Returns the number of metacards written. Entries replaced while their
    /// batch was in flight stay queued; entries from failed batches are kept.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        *self.last_flush.lock() = Instant::now();

        let snapshot: Vec<(DocumentKey, BacklogEntry)> = self
            .backlog
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let batch_size = self.config.batch_size.max(1);
        let mut written = 0usize;
        let mut last_error = None;

        for batch in snapshot.chunks(batch_size) {
            let metacards: Vec<Metacard> =
                batch.iter().map(|(_, entry)| entry.metacard.clone()).collect();

            match self.cache.create(metacards).await {
                Ok(_) => {
                    for (key, entry) in batch {
                        self.backlog
                            .remove_if(key, |_, current| current.version == entry.version);
                    }
                    written += batch.len();
                    metrics::record_flush(true);
                }
                Err(e) => {
                    self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                    metrics::record_flush(false);
                    warn!("Cache flush batch of {} failed: {}", batch.len(), e);
                    last_error = Some(e);
                }
            }
        }

        self.stats
            .flushed
            .fetch_add(written as u64, Ordering::Relaxed);
        metrics::set_backlog_size(self.backlog.len());

        if written > 0 {
            if let Err(e) = self.cache.force_commit().await {
                warn!("Commit after flush failed: {}", e);
            }
            debug!("Flushed {} results, {} still queued", written, self.backlog.len());
        }

        match last_error {
            Some(e) if written == 0 => Err(e),
            _ => Ok(written),
        }
    }

    /// Spawn the periodic flusher
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Flusher loop; runs until `shutdown`
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting bulk cache writer (tick {:?}, flush every {:?}, batch {})",
            self.config.tick_interval, self.config.flush_interval, self.config.batch_size
        );

        let mut tick = interval(timer_period("Bulk writer tick", self.config.tick_interval));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let writer = Arc::clone(&self);
                    let cycle = tokio::spawn(async move { writer.flush_if_due().await });
                    match cycle.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => debug!("Flush cycle failed: {}", e),
                        Err(e) => error!("Flush cycle panicked: {}", e),
                    }
                }
                _ = self.shutdown.wait() => {
                    info!("Bulk cache writer shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the flusher and write out whatever is queued
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        if let Err(e) = self.flush().await {
            warn!("Final cache flush failed: {}", e);
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn snapshot(&self) -> BulkWriterSnapshot {
        BulkWriterSnapshot {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            flushed: self.stats.flushed.load(Ordering::Relaxed),
            failed_batches: self.stats.failed_batches.load(Ordering::Relaxed),
            backlog: self.backlog.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
