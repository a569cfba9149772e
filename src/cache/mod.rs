//! Result Cache Subsystem
//!
//! Write-through cache of federated results plus the two write paths that
//! feed it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Source query tasks                            │
//! ├───────────────────────────────┬──────────────────────────────────────┤
//! │  mode=update (fire & forget)  │  mode=index (read-your-write)         │
//! │  ┌─────────────────────────┐  │  ┌────────────────────────────────┐  │
//! │  │ BulkCacheWriter         │  │  │ CommitCoordinator              │  │
//! │  │ backlog keyed by        │  │  │ PhaseBarrier, 1s advancer,     │  │
//! │  │ source+id, batch flush  │  │  │ one commit per phase           │  │
//! │  └───────────┬─────────────┘  │  └───────────────┬────────────────┘  │
//! │              └────────────────┴──────────────────┘                   │
//! │                               │                                       │
//! │                        ResultCache                                    │
//! │          create / query / delete / force_commit / expiry              │
//! │                               │                                       │
//! │                  DocumentStore (external client)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Caching is best-effort: no failure in this module is ever surfaced to a
//! federated query caller.

mod barrier;
mod bulk_writer;
mod commit;
mod result_cache;

pub use barrier::{AdvanceCallback, Party, PhaseBarrier};
pub use bulk_writer::{BulkCacheWriter, BulkWriterConfig, BulkWriterSnapshot};
pub use commit::{CommitCoordinator, CommitCoordinatorConfig, CommitSnapshot};
pub use result_cache::{ResultCache, ResultCacheConfig, CACHE_SOURCE_ID};

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

/// Shortest period any cache timer runs at
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Period for a timer loop; `tokio::time::interval` panics on zero
pub(crate) fn timer_period(timer: &str, period: Duration) -> Duration {
    if period.is_zero() {
        warn!("{} period is zero, using {:?}", timer, MIN_TIMER_PERIOD);
        return MIN_TIMER_PERIOD;
    }
    period
}

/// One-shot shutdown flag that background loops can also await
#[derive(Debug)]
pub(crate) struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }
}

impl ShutdownSignal {
    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on trigger
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}
