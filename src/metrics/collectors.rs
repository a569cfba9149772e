//! Prometheus collectors for federation and cache activity
//!
//! Collectors live in the default registry so the binary's `/metrics`
//! endpoint picks them up through `prometheus::gather()`. Registration
//! happens once, on first use; if it fails the recorders become no-ops.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::warn;

struct Collectors {
    federated_queries: IntCounterVec,
    source_timeouts: IntCounterVec,
    source_failures: IntCounterVec,
    source_latency: HistogramVec,
    backlog_size: IntGauge,
    backlog_dropped: IntCounter,
    cache_flushes: IntCounter,
    cache_flush_failures: IntCounter,
    cache_commits: IntCounter,
    phase_advances: IntCounter,
    expired_documents: IntCounter,
}

impl Collectors {
    fn build(registry: &Registry) -> prometheus::Result<Self> {
        let federated_queries = IntCounterVec::new(
            Opts::new("fedcache_federated_queries_total", "Federated queries by mode"),
            &["mode"],
        )?;
        let source_timeouts = IntCounterVec::new(
            Opts::new("fedcache_source_timeouts_total", "Sources abandoned at the query deadline"),
            &["source"],
        )?;
        let source_failures = IntCounterVec::new(
            Opts::new("fedcache_source_failures_total", "Source queries that failed"),
            &["source"],
        )?;
        let source_latency = HistogramVec::new(
            HistogramOpts::new("fedcache_source_query_seconds", "Per-source query latency"),
            &["source"],
        )?;
        let backlog_size = IntGauge::new(
            "fedcache_cache_backlog_size",
            "Entries waiting in the bulk cache backlog",
        )?;
        let backlog_dropped = IntCounter::new(
            "fedcache_cache_backlog_dropped_total",
            "Results dropped because the backlog was full",
        )?;
        let cache_flushes =
            IntCounter::new("fedcache_cache_flushes_total", "Bulk backlog flush batches written")?;
        let cache_flush_failures = IntCounter::new(
            "fedcache_cache_flush_failures_total",
            "Bulk backlog flush batches that failed",
        )?;
        let cache_commits =
            IntCounter::new("fedcache_cache_commits_total", "Commits issued to the cache store")?;
        let phase_advances = IntCounter::new(
            "fedcache_commit_phase_advances_total",
            "Phases advanced by the commit coordinator",
        )?;
        let expired_documents = IntCounter::new(
            "fedcache_cache_expired_documents_total",
            "Documents removed by cache expiry",
        )?;

        registry.register(Box::new(federated_queries.clone()))?;
        registry.register(Box::new(source_timeouts.clone()))?;
        registry.register(Box::new(source_failures.clone()))?;
        registry.register(Box::new(source_latency.clone()))?;
        registry.register(Box::new(backlog_size.clone()))?;
        registry.register(Box::new(backlog_dropped.clone()))?;
        registry.register(Box::new(cache_flushes.clone()))?;
        registry.register(Box::new(cache_flush_failures.clone()))?;
        registry.register(Box::new(cache_commits.clone()))?;
        registry.register(Box::new(phase_advances.clone()))?;
        registry.register(Box::new(expired_documents.clone()))?;

        Ok(Self {
            federated_queries,
            source_timeouts,
            source_failures,
            source_latency,
            backlog_size,
            backlog_dropped,
            cache_flushes,
            cache_flush_failures,
            cache_commits,
            phase_advances,
            expired_documents,
        })
    }
}

static COLLECTORS: Lazy<Option<Collectors>> =
    Lazy::new(|| match Collectors::build(prometheus::default_registry()) {
        Ok(collectors) => Some(collectors),
        Err(e) => {
            warn!("Failed to register federation metrics: {}", e);
            None
        }
    });

fn with<F: FnOnce(&Collectors)>(f: F) {
    if let Some(collectors) = COLLECTORS.as_ref() {
        f(collectors);
    }
}

/// Force registration so the collectors show up before first use
pub fn init() {
    Lazy::force(&COLLECTORS);
}

pub fn record_federated_query(mode: &str) {
    with(|c| c.federated_queries.with_label_values(&[mode]).inc());
}

pub fn record_source_timeout(source: &str) {
    with(|c| c.source_timeouts.with_label_values(&[source]).inc());
}

pub fn record_source_failure(source: &str) {
    with(|c| c.source_failures.with_label_values(&[source]).inc());
}

pub fn observe_source_latency(source: &str, elapsed: Duration) {
    with(|c| {
        c.source_latency
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64())
    });
}

pub fn set_backlog_size(size: usize) {
    with(|c| c.backlog_size.set(size as i64));
}

pub fn record_backlog_dropped(count: usize) {
    with(|c| c.backlog_dropped.inc_by(count as u64));
}

pub fn record_flush(succeeded: bool) {
    with(|c| {
        if succeeded {
            c.cache_flushes.inc();
        } else {
            c.cache_flush_failures.inc();
        }
    });
}

pub fn record_cache_commit() {
    with(|c| c.cache_commits.inc());
}

pub fn record_phase_advance() {
    with(|c| c.phase_advances.inc());
}

pub fn record_expired(count: u64) {
    with(|c| c.expired_documents.inc_by(count));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collectors_register_in_fresh_registry() {
        let registry = Registry::new();
        let collectors = Collectors::build(&registry).unwrap();
        collectors.federated_queries.with_label_values(&["index"]).inc();

        use prometheus::{Encoder, TextEncoder};
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("fedcache_federated_queries_total{mode=\"index\"} 1"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        Collectors::build(&registry).unwrap();
        assert!(Collectors::build(&registry).is_err());
    }

    #[test]
    fn test_recorders_do_not_panic() {
        init();
        record_federated_query("native");
        record_source_timeout("slow");
        observe_source_latency("slow", Duration::from_millis(12));
        set_backlog_size(3);
        record_backlog_dropped(2);
        record_flush(true);
        record_flush(false);
        record_cache_commit();
        record_phase_advance();
        record_expired(4);
    }
}
