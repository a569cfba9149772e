//! Commit Coordinator
//!
//! Gives index-mode queries read-your-write visibility while issuing at most
//! one store commit per phase.
//!
//! ```text
//!   add(batch) ─► join ─► create ─► arrive+deregister ─► await_advance ─┐
//!                                                                       │
//!   advancer (permanent party) ── every advance_period ──► arrive ──┐   │
//!                                                                   ▼   ▼
//!                                          on_advance: force_commit, phase+1
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::barrier::PhaseBarrier;
use super::result_cache::ResultCache;
use super::{timer_period, ShutdownSignal};
use crate::domain::Metacard;
use crate::error::Result;
use crate::metrics::collectors as metrics;

/// Configuration for the commit coordinator
#[derive(Debug, Clone)]
pub struct CommitCoordinatorConfig {
    /// How often the advancer arrives at the barrier
    pub advance_period: Duration,
}

impl Default for CommitCoordinatorConfig {
    fn default() -> Self {
        Self {
            advance_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct CommitStats {
    adds: AtomicU64,
    advances: AtomicU64,
    commit_failures: AtomicU64,
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSnapshot {
    pub adds: u64,
    pub advances: u64,
    pub commit_failures: u64,
    pub phase: u64,
}

/// Phased commit coordinator
pub struct CommitCoordinator {
    cache: Arc<ResultCache>,
    barrier: PhaseBarrier,
    stats: Arc<CommitStats>,
    config: CommitCoordinatorConfig,
    shutdown: ShutdownSignal,
}

impl CommitCoordinator {
    pub fn new(cache: Arc<ResultCache>, config: CommitCoordinatorConfig) -> Arc<Self> {
        let stats = Arc::new(CommitStats::default());

        let on_advance = {
            let cache = Arc::clone(&cache);
            let stats = Arc::clone(&stats);
            Arc::new(move |phase: u64| {
                let cache = Arc::clone(&cache);
                let stats = Arc::clone(&stats);
                async move {
                    if let Err(e) = cache.force_commit().await {
                        stats.commit_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Commit for phase {} failed: {}", phase, e);
                    }
                    stats.advances.fetch_add(1, Ordering::Relaxed);
                    metrics::record_phase_advance();
                }
                .boxed()
            })
        };

        Arc::new(Self {
            cache,
            barrier: PhaseBarrier::with_callback(on_advance),
            stats,
            config,
            shutdown: ShutdownSignal::default(),
        })
    }

    /// Spawn the advancer task
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Advancer loop; holds the one permanent party and arrives once per period
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.barrier.register().await {
            warn!("Commit advancer could not register: {}", e);
            return;
        }
        info!(
            "Starting commit coordinator (period {:?})",
            self.config.advance_period
        );

        let mut tick = interval(timer_period("Commit advance", self.config.advance_period));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick is immediate
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.barrier.arrive_and_await_advance().await {
                        Ok(phase) => debug!("Commit phase advanced to {}", phase),
                        Err(e) => {
                            debug!("Commit advancer stopping: {}", e);
                            break;
                        }
                    }
                }
                _ = self.shutdown.wait() => {
                    info!("Commit coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// Cache `metacards` and return once a commit covering them has completed.
    ///
    /// Fails without waiting if the cache write fails.
    #[instrument(skip(self, metacards), fields(count = metacards.len()))]
    pub async fn add(&self, metacards: Vec<Metacard>) -> Result<()> {
        self.stats.adds.fetch_add(1, Ordering::Relaxed);
        let party = self.barrier.join().await?;

        let written = self.cache.create(metacards).await;
        let phase = party.arrive_and_deregister().await?;

        if let Err(e) = written {
            warn!("Index-mode cache write failed: {}", e);
            return Err(e);
        }

        self.barrier.await_advance(phase).await?;
        Ok(())
    }

    pub fn barrier(&self) -> &PhaseBarrier {
        &self.barrier
    }

    pub fn snapshot(&self) -> CommitSnapshot {
        CommitSnapshot {
            adds: self.stats.adds.load(Ordering::Relaxed),
            advances: self.stats.advances.load(Ordering::Relaxed),
            commit_failures: self.stats.commit_failures.load(Ordering::Relaxed),
            phase: self.barrier.phase(),
        }
    }

    /// Stop the advancer and release every waiter
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.barrier.force_termination();
    }
}

// =============================================================================
// Tests
// =============================================================================
