//! Domain Layer
//!
//! Value types, filter predicates and the ports the federation engine
//! depends on.
//!
//! - **Types** (`types.rs`) - queries, requests, results and responses
//! - **Filter** (`filter.rs`) - opaque metacard predicates
//! - **Ports** (`ports.rs`) - trait abstractions for sources, plugins and the cache store

pub mod filter;
pub mod ports;
pub mod types;

pub use filter::{match_all, And, AttributeEquals, Filter, IdIn, MatchAll, TitleContains};
pub use ports::{
    CachedDocument, DocumentStore, PostQueryPlugin, PreQueryPlugin, Source, StoreQuery,
    StoreQueryResult,
};
pub use types::{
    source_elapsed_key, DetailKind, DocumentKey, GeoPoint, Metacard, ProcessingDetail, PropertyMap,
    Query, QueryMode, QueryRequest, QueryResponse, ResultEntry, Severity, SortBy, SortOrder,
    SourceResponse, SOURCE_ELAPSED_PREFIX,
};
