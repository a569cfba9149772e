//! Domain value types
//!
//! Queries and requests are immutable descriptors created per federation call;
//! responses are produced by sources and consumed once by the merger.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::{And, Filter};
use crate::error::{Error, Result};

/// Free-form property bag carried on requests and responses
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// Default number of results per page
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Default query timeout (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Property key prefix for per-source elapsed time annotations
pub const SOURCE_ELAPSED_PREFIX: &str = "source.elapsed.";

/// Property key of the elapsed time annotation for one source
pub fn source_elapsed_key(source_id: &str) -> String {
    format!("{}{}", SOURCE_ELAPSED_PREFIX, source_id)
}

// =============================================================================
// Metacard
// =============================================================================

/// Point geometry (WGS84 degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Identity of a cached document: source id plus document id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub source_id: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(source_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            id: id.into(),
        }
    }

    /// Both halves of the identity are present
    pub fn is_complete(&self) -> bool {
        !self.source_id.trim().is_empty() && !self.id.trim().is_empty()
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_id, self.id)
    }
}

/// Opaque metadata document returned by sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metacard {
    pub id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub modified: DateTime<Utc>,
    pub effective: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub attributes: PropertyMap,
}

impl Metacard {
    /// Create a metacard modified "now"
    pub fn new(id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            title: None,
            modified: Utc::now(),
            effective: None,
            location: None,
            attributes: PropertyMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_effective(mut self, effective: DateTime<Utc>) -> Self {
        self.effective = Some(effective);
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.source_id.clone(), self.id.clone())
    }

    /// Effective date, falling back to the modified date
    pub fn temporal(&self) -> DateTime<Utc> {
        self.effective.unwrap_or(self.modified)
    }

    /// Look up an attribute, resolving the well-known fields first
    pub fn attribute(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "id" => Some(serde_json::Value::String(self.id.clone())),
            "source-id" => Some(serde_json::Value::String(self.source_id.clone())),
            "title" => self.title.clone().map(serde_json::Value::String),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

// =============================================================================
// Result
// =============================================================================

/// A scored wrapper around a metacard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub metacard: Metacard,
    /// Relevance score assigned by the source, higher is better
    pub relevance: Option<f64>,
    /// Distance from the query geometry in meters
    pub distance_meters: Option<f64>,
}

impl ResultEntry {
    pub fn new(metacard: Metacard) -> Self {
        Self {
            metacard,
            relevance: None,
            distance_meters: None,
        }
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_distance(mut self, meters: f64) -> Self {
        self.distance_meters = Some(meters);
        self
    }

    pub fn id(&self) -> &str {
        &self.metacard.id
    }

    pub fn source_id(&self) -> &str {
        &self.metacard.source_id
    }
}

// =============================================================================
// Query
// =============================================================================

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sort specification: property name plus direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub property: String,
    pub order: SortOrder,
}

impl SortBy {
    pub fn new(property: impl Into<String>, order: SortOrder) -> Self {
        Self {
            property: property.into(),
            order,
        }
    }

    pub fn relevance() -> Self {
        Self::new("RELEVANCE", SortOrder::Descending)
    }

    pub fn temporal(order: SortOrder) -> Self {
        Self::new("TEMPORAL", order)
    }

    pub fn distance() -> Self {
        Self::new("DISTANCE", SortOrder::Ascending)
    }
}

/// Immutable query descriptor
#[derive(Debug, Clone)]
pub struct Query {
    filter: Arc<dyn Filter>,
    start_index: usize,
    page_size: usize,
    sort: Option<SortBy>,
    request_total_count: bool,
    timeout_ms: u64,
}

impl Query {
    /// Query starting at index 1 with default page size and timeout
    pub fn new(filter: Arc<dyn Filter>) -> Self {
        Self {
            filter,
            start_index: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: None,
            request_total_count: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// 1-based start index
    pub fn with_start_index(mut self, start_index: usize) -> Self {
        self.start_index = start_index;
        self
    }

    /// Page size, 0 means unbounded
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_sort(mut self, sort: SortBy) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_request_total_count(mut self, requested: bool) -> Self {
        self.request_total_count = requested;
        self
    }

    /// Timeout in milliseconds, 0 waits indefinitely
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn filter(&self) -> &Arc<dyn Filter> {
        &self.filter
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn sort(&self) -> Option<&SortBy> {
        self.sort.as_ref()
    }

    pub fn requests_total_count(&self) -> bool {
        self.request_total_count
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn is_unbounded(&self) -> bool {
        self.page_size == 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_index < 1 {
            return Err(Error::InvalidQuery(format!(
                "start index must be >= 1, got {}",
                self.start_index
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Query Request
// =============================================================================

/// How a federated request interacts with the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Query the sources, never touch the cache
    Native,
    /// Answer from the cache only
    Cache,
    /// Query the sources and block until their results are committed to the cache
    Index,
    /// Query the sources and cache their results in the background
    Update,
}

impl std::fmt::Display for QueryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryMode::Native => write!(f, "native"),
            QueryMode::Cache => write!(f, "cache"),
            QueryMode::Index => write!(f, "index"),
            QueryMode::Update => write!(f, "update"),
        }
    }
}

impl std::str::FromStr for QueryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "native" => Ok(QueryMode::Native),
            "cache" => Ok(QueryMode::Cache),
            "index" => Ok(QueryMode::Index),
            "update" => Ok(QueryMode::Update),
            other => Err(Error::InvalidQuery(format!("unknown query mode: {}", other))),
        }
    }
}

/// A query plus its targets and mode
#[derive(Debug, Clone)]
pub struct QueryRequest {
    query: Query,
    source_ids: Vec<String>,
    enterprise: bool,
    mode: Option<QueryMode>,
    properties: PropertyMap,
}

impl QueryRequest {
    /// Enterprise-wide request (no explicit targets)
    pub fn new(query: Query) -> Self {
        Self {
            query,
            source_ids: Vec::new(),
            enterprise: false,
            mode: None,
            properties: PropertyMap::new(),
        }
    }

    pub fn with_source_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_enterprise(mut self, enterprise: bool) -> Self {
        self.enterprise = enterprise;
        self
    }

    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Derived copy with a different query
    pub fn with_query(&self, query: Query) -> Self {
        Self {
            query,
            ..self.clone()
        }
    }

    /// Derived copy whose filter also requires `filter`
    pub fn with_added_filter(&self, filter: Arc<dyn Filter>) -> Self {
        let combined: Arc<dyn Filter> =
            Arc::new(And::new(vec![Arc::clone(self.query.filter()), filter]));
        self.with_query(self.query.clone().with_filter(combined))
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn source_ids(&self) -> &[String] {
        &self.source_ids
    }

    pub fn mode(&self) -> Option<QueryMode> {
        self.mode
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// No explicit targets, or the enterprise flag is set
    pub fn is_enterprise(&self) -> bool {
        self.enterprise || self.source_ids.is_empty()
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Severity of a processing detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// What went wrong while obtaining a source's contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetailKind {
    Timeout,
    Interrupted,
    ExecutionFailure,
    NullResponse,
    UnsupportedQuery,
    SourceWarning,
}

impl DetailKind {
    pub fn severity(&self) -> Severity {
        match self {
            DetailKind::Timeout | DetailKind::Interrupted | DetailKind::SourceWarning => {
                Severity::Warning
            }
            DetailKind::ExecutionFailure
            | DetailKind::NullResponse
            | DetailKind::UnsupportedQuery => Severity::Error,
        }
    }
}

/// Per-source diagnostic attached to a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingDetail {
    pub source_id: String,
    pub kind: DetailKind,
    pub severity: Severity,
    pub message: String,
}

impl ProcessingDetail {
    pub fn new(source_id: impl Into<String>, kind: DetailKind, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            severity: kind.severity(),
            message: message.into(),
        }
    }

    pub fn null_response(source_id: &str) -> Self {
        Self::new(
            source_id,
            DetailKind::NullResponse,
            format!("Source {} returned no response", source_id),
        )
    }

    /// Diagnostic for an error raised by a source, classified by variant
    pub fn from_error(source_id: &str, err: &Error) -> Self {
        match err {
            Error::UnsupportedQuery { reason, .. } => {
                Self::new(source_id, DetailKind::UnsupportedQuery, reason.clone())
            }
            Error::SourceExecution { reason, .. } => {
                Self::new(source_id, DetailKind::ExecutionFailure, reason.clone())
            }
            Error::SourceTimeout { .. } => Self::new(source_id, DetailKind::Timeout, err.to_string()),
            Error::Interrupted { .. } => {
                Self::new(source_id, DetailKind::Interrupted, err.to_string())
            }
            other => Self::new(source_id, DetailKind::ExecutionFailure, other.to_string()),
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// One source's answer to a request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceResponse {
    pub source_id: String,
    pub results: Vec<ResultEntry>,
    /// Total hits the source knows about; may exceed `results.len()`
    pub hits: u64,
    pub properties: PropertyMap,
    pub processing_details: Vec<ProcessingDetail>,
}

impl SourceResponse {
    pub fn new(source_id: impl Into<String>, results: Vec<ResultEntry>, hits: u64) -> Self {
        Self {
            source_id: source_id.into(),
            results,
            hits,
            properties: PropertyMap::new(),
            processing_details: Vec::new(),
        }
    }

    /// Elapsed time annotation for this response's source, in milliseconds
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.properties
            .get(&source_elapsed_key(&self.source_id))
            .and_then(|v| v.as_u64())
    }
}

/// Aggregate answer returned to the federation caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub results: Vec<ResultEntry>,
    pub hits: u64,
    pub processing_details: Vec<ProcessingDetail>,
    pub properties: PropertyMap,
    pub hits_per_source: BTreeMap<String, u64>,
}

impl QueryResponse {
    pub fn empty(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// Diagnostics recorded for one source
    pub fn details_for(&self, source_id: &str) -> Vec<&ProcessingDetail> {
        self.processing_details
            .iter()
            .filter(|d| d.source_id == source_id)
            .collect()
    }

    pub fn result_ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.id()).collect()
    }
}
