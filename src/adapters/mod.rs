//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │          Source │ DocumentStore │ Pre/PostQueryPlugin       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │   InMemoryDocumentStore (DocumentStore)                     │ │
//! │  │   CacheSource (Source over ResultCache)                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fedcache::adapters::InMemoryDocumentStore;
//! use fedcache::cache::{ResultCache, ResultCacheConfig};
//!
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let cache = ResultCache::new(store, ResultCacheConfig::default());
//! ```

mod cache_source;
mod memory_store;

pub use cache_source::CacheSource;
pub use memory_store::InMemoryDocumentStore;
