//! fedcache - Caching Federation Query Engine
//!
//! Fans a query out to many heterogeneous sources at once, merges their
//! partial answers under a deadline, corrects offsets that no single source
//! can honour, and warms a write-through result cache with either
//! fire-and-forget or read-your-write consistency.
//!
//! # Architecture
//!
//! ```text
//! FederationStrategy → SourceQueryExecutor → SortedQueryMonitor
//!                              │
//!            BulkCacheWriter / CommitCoordinator → ResultCache → DocumentStore
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Port implementations (in-memory store, cache pseudo-source)
//! - [`cache`] - Result cache, bulk writer, phase barrier and commit coordinator
//! - [`domain`] - Value types, filter predicates and ports
//! - [`error`] - Error types
//! - [`federation`] - Executor, monitor, comparators, offset compensation, strategy
//! - [`metrics`] - Prometheus collectors

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;
pub mod federation;
pub mod metrics;

// Re-export commonly used types
pub use cache::{BulkCacheWriter, CommitCoordinator, PhaseBarrier, ResultCache};
pub use domain::{Query, QueryMode, QueryRequest, QueryResponse, Source};
pub use error::{Error, Result};
pub use federation::{FederationConfig, FederationStrategy, InterruptHandle};
