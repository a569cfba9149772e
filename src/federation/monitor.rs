//! Sorted Query Monitor
//!
//! Drains submitted source queries in completion order under one absolute
//! deadline and folds them into a single response.
//!
//! ```text
//!   pending ──► FuturesUnordered ──► next completed ──► accumulate
//!                      │                  │
//!                      │ deadline hit     │ interrupt fired
//!                      ▼                  ▼
//!           Timeout on every       Interrupted on every
//!           outstanding source     outstanding source
//! ```
//!
//! A source abandoned at the deadline keeps running detached; anything it
//! produces later is ignored.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, instrument, warn};

use super::executor::PendingSource;
use super::sort::SortPolicy;
use crate::cache::ResultCache;
use crate::domain::{DetailKind, ProcessingDetail, QueryRequest, QueryResponse, SourceResponse};
use crate::error::{Error, Result};
use crate::metrics::collectors as metrics;

// =============================================================================
// Interrupt Handle
// =============================================================================

/// Caller-side switch that stops a merge in progress
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `interrupt` has been called
    pub async fn interrupted(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Where the final result list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrigin {
    /// Locally sorted merge of the source responses
    Sources,
    /// Re-read of the committed cache
    Cache,
}

type Completed = (String, std::result::Result<Result<Option<SourceResponse>>, JoinError>);

/// Collects per-source responses into one sorted page
pub struct SortedQueryMonitor {
    /// Request as sent to the sources; drives timeout, sort and truncation
    request: QueryRequest,
    interrupt: InterruptHandle,
    /// Cache and caller request for the index-mode re-read
    reread: Option<(Arc<ResultCache>, QueryRequest)>,
}

impl SortedQueryMonitor {
    pub fn new(request: QueryRequest, interrupt: InterruptHandle) -> Self {
        Self {
            request,
            interrupt,
            reread: None,
        }
    }

    /// In index mode, answer from the cache once the sources have been drained
    pub fn with_cache_reread(mut self, cache: Arc<ResultCache>, request: QueryRequest) -> Self {
        self.reread = Some((cache, request));
        self
    }

    #[instrument(skip(self, pending), fields(sources = pending.len()))]
    pub async fn collect(
        &self,
        request_id: &str,
        pending: Vec<PendingSource>,
    ) -> (QueryResponse, MergeOrigin) {
        let mut response = QueryResponse::empty(request_id);
        let timeout_ms = self.request.query().timeout_ms();
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        let mut outstanding: BTreeSet<String> =
            pending.iter().map(|p| p.source_id.clone()).collect();
        let index_flags: Vec<Arc<AtomicBool>> =
            pending.iter().map(|p| Arc::clone(&p.index_failed)).collect();
        let mut in_flight: FuturesUnordered<_> = pending
            .into_iter()
            .map(|p| async move { (p.source_id, p.handle.await) })
            .collect();

        while !outstanding.is_empty() {
            let next = async {
                match deadline {
                    Some(deadline) => timeout_at(deadline, in_flight.next()).await.ok(),
                    None => Some(in_flight.next().await),
                }
            };

            tokio::select! {
                biased;

                _ = self.interrupt.interrupted() => {
                    warn!("Interrupted with {} sources outstanding", outstanding.len());
                    for source_id in &outstanding {
                        response
                            .processing_details
                            .push(ProcessingDetail::from_error(
                                source_id,
                                &Error::Interrupted {
                                    source_id: source_id.clone(),
                                },
                            ));
                    }
                    break;
                }
                completed = next => match completed {
                    None => {
                        warn!(
                            "Timed out after {}ms waiting on {} sources",
                            timeout_ms,
                            outstanding.len()
                        );
                        for source_id in &outstanding {
                            metrics::record_source_timeout(source_id);
                            response
                                .processing_details
                                .push(ProcessingDetail::from_error(
                                    source_id,
                                    &Error::SourceTimeout {
                                        source_id: source_id.clone(),
                                        elapsed_ms: timeout_ms,
                                    },
                                ));
                        }
                        break;
                    }
                    Some(None) => break,
                    Some(Some(completed)) => {
                        outstanding.remove(&completed.0);
                        accumulate(&mut response, completed);
                    }
                },
            }
        }

        let index_failed = index_flags.iter().any(|f| f.load(Ordering::Acquire));
        if let Some((cache, original)) = self.reread.as_ref().filter(|_| !index_failed) {
            match cache.query(original).await {
                Ok(cached) => {
                    debug!("Answered from committed cache ({} results)", cached.results.len());
                    response.results = cached.results;
                    return (response, MergeOrigin::Cache);
                }
                Err(e) => warn!("Cache re-read failed, using source results: {}", e),
            }
        } else if self.reread.is_some() {
            warn!("Index-mode cache write failed, using source results");
        }

        let policy = SortPolicy::for_sort(self.request.query().sort());
        policy.sort(&mut response.results);
        let page_size = self.request.query().page_size();
        if page_size > 0 {
            response.results.truncate(page_size);
        }

        (response, MergeOrigin::Sources)
    }
}

fn accumulate(response: &mut QueryResponse, (source_id, joined): Completed) {
    match joined {
        Ok(Ok(Some(source_response))) => {
            debug!(
                "Merging {} results from {}",
                source_response.results.len(),
                source_id
            );
            response.hits += source_response.hits;
            *response
                .hits_per_source
                .entry(source_response.source_id.clone())
                .or_insert(0) += source_response.hits;
            response.results.extend(source_response.results);
            response.properties.extend(source_response.properties);
            response
                .processing_details
                .extend(source_response.processing_details);
        }
        Ok(Ok(None)) => {
            response
                .processing_details
                .push(ProcessingDetail::null_response(&source_id));
        }
        Ok(Err(e)) => {
            warn!("Source {} failed: {}", source_id, e);
            response
                .processing_details
                .push(ProcessingDetail::from_error(&source_id, &e));
        }
        Err(e) => {
            warn!("Query task for {} did not complete: {}", source_id, e);
            metrics::record_source_failure(&source_id);
            response.processing_details.push(ProcessingDetail::new(
                source_id.as_str(),
                DetailKind::ExecutionFailure,
                e.to_string(),
            ));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
