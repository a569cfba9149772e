//! Federation Engine
//!
//! Fans a query out to many sources at once, merges their answers under a
//! deadline and warms the result cache on the way through.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      FederationStrategy                          │
//! │   clamp / validate ─► OffsetPlan ─► post-query plugins           │
//! ├──────────────────────────────┬───────────────────────────────────┤
//! │    SourceQueryExecutor       │       SortedQueryMonitor          │
//! │  ┌────────────────────────┐  │  ┌─────────────────────────────┐  │
//! │  │ pre-query plugins      │  │  │ completion-order drain      │  │
//! │  │ semaphore-gated tasks  │──┼─►│ deadline / interrupt        │  │
//! │  │ cache routing by mode  │  │  │ SortPolicy + truncate       │  │
//! │  └────────────────────────┘  │  └─────────────────────────────┘  │
//! └──────────────────────────────┴───────────────────────────────────┘
//! ```

mod config;
mod executor;
mod monitor;
mod offset;
mod proptest;
mod sort;
mod strategy;
#[cfg(test)]
mod testing;

pub use config::{FederationConfig, DEFAULT_MAX_START_INDEX};
pub use executor::{dedupe_sources, CacheRoute, PendingSource, SourceQueryExecutor};
pub use monitor::{InterruptHandle, MergeOrigin, SortedQueryMonitor};
pub use offset::{apply_window, OffsetPlan};
pub use sort::SortPolicy;
pub use strategy::FederationStrategy;
