//! fedcache daemon
//!
//! Boots the result cache and its write paths, then serves health and
//! metrics endpoints until interrupted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         fedcache daemon                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Cache expiry │    │ Bulk writer  │    │ Commit phase │       │
//! │  │   (timer)    │    │   flusher    │    │   advancer   │       │
//! │  └──────┬───────┘    └──────┬───────┘    └──────┬───────┘       │
//! │         └───────────────────┼───────────────────┘               │
//! │                        ResultCache                               │
//! │   /healthz /readyz (health addr)      /metrics (metrics addr)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fedcache::adapters::InMemoryDocumentStore;
use fedcache::cache::{
    BulkCacheWriter, BulkWriterConfig, CommitCoordinator, CommitCoordinatorConfig, ResultCache,
    ResultCacheConfig,
};
use fedcache::error::{Error, Result};
use fedcache::federation::{FederationConfig, FederationStrategy};

// =============================================================================
// CLI Arguments
// =============================================================================

/// fedcache - caching federation engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Start indexes above this are clamped
    #[arg(long, env = "MAX_START_INDEX", default_value = "50000")]
    max_start_index: usize,

    /// Maximum source queries in flight
    #[arg(long, env = "MAX_CONCURRENT_QUERIES", default_value = "64")]
    max_concurrent_queries: usize,

    /// Maximum background cache writes in flight
    #[arg(long, env = "MAX_CONCURRENT_CACHE_WRITES", default_value = "8")]
    max_concurrent_cache_writes: usize,

    /// Cache results of requests that name no mode
    #[arg(long, env = "CACHE_EVERYTHING")]
    cache_everything: bool,

    /// Mirror remote ingests into the cache
    #[arg(long, env = "CACHE_REMOTE_INGESTS")]
    cache_remote_ingests: bool,

    /// Hide error-severity processing details from responses
    #[arg(long, env = "HIDE_ERRORS")]
    hide_errors: bool,

    /// Hide warning-severity processing details from responses
    #[arg(long, env = "HIDE_WARNINGS")]
    hide_warnings: bool,

    /// Minimum seconds between cache backlog flushes
    #[arg(long, env = "CACHE_FLUSH_INTERVAL_SECONDS", default_value = "10")]
    cache_flush_interval_seconds: u64,

    /// Documents per cache write
    #[arg(long, env = "CACHE_BATCH_SIZE", default_value = "500")]
    cache_batch_size: usize,

    /// Cache backlog cap
    #[arg(long, env = "CACHE_MAX_BACKLOG", default_value = "10000")]
    cache_max_backlog: usize,

    /// Minutes between cache expiry runs
    #[arg(long, env = "CACHE_EXPIRY_INTERVAL_MINUTES", default_value = "10")]
    cache_expiry_interval_minutes: u64,

    /// Age in minutes after which cached documents expire
    #[arg(long, env = "CACHE_EXPIRY_AGE_MINUTES", default_value = "10080")]
    cache_expiry_age_minutes: u64,

    /// Commit phase period in milliseconds
    #[arg(long, env = "COMMIT_PERIOD_MS", default_value = "1000")]
    commit_period_ms: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn federation_config(&self) -> FederationConfig {
        FederationConfig {
            max_start_index: self.max_start_index,
            max_concurrent_queries: self.max_concurrent_queries,
            max_concurrent_cache_writes: self.max_concurrent_cache_writes,
            cache_everything: self.cache_everything,
            cache_remote_ingests: self.cache_remote_ingests,
            show_errors: !self.hide_errors,
            show_warnings: !self.hide_warnings,
        }
    }

    fn cache_config(&self) -> ResultCacheConfig {
        ResultCacheConfig {
            expiration_interval: Duration::from_secs(self.cache_expiry_interval_minutes * 60),
            expiration_age: Duration::from_secs(self.cache_expiry_age_minutes * 60),
        }
    }

    fn bulk_writer_config(&self) -> BulkWriterConfig {
        BulkWriterConfig {
            flush_interval: Duration::from_secs(self.cache_flush_interval_seconds),
            batch_size: self.cache_batch_size,
            maximum_backlog_size: self.cache_max_backlog,
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;
    fedcache::metrics::init();

    info!("Starting fedcache");
    info!("  Max start index: {}", args.max_start_index);
    info!("  Max concurrent queries: {}", args.max_concurrent_queries);
    info!("  Cache everything: {}", args.cache_everything);
    info!(
        "  Cache backlog: batch {} / max {}",
        args.cache_batch_size, args.cache_max_backlog
    );

    // Cache subsystem
    let store = Arc::new(InMemoryDocumentStore::new());
    let cache = ResultCache::new(store, args.cache_config());
    let bulk_writer = BulkCacheWriter::new(Arc::clone(&cache), args.bulk_writer_config());
    let coordinator = CommitCoordinator::new(
        Arc::clone(&cache),
        CommitCoordinatorConfig {
            advance_period: Duration::from_millis(args.commit_period_ms.max(1)),
        },
    );

    let expiry_handle = cache.start_expiry();
    let flusher_handle = bulk_writer.start();
    let advancer_handle = coordinator.start();

    let strategy = Arc::new(FederationStrategy::new(
        Arc::clone(&cache),
        bulk_writer,
        coordinator,
        args.federation_config(),
    ));
    info!("Cache subsystem initialized");

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_cache = Arc::clone(&cache);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    strategy.shutdown().await;
    for (name, handle) in [
        ("expiry", expiry_handle),
        ("flusher", flusher_handle),
        ("advancer", advancer_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task ended abnormally: {}", name, e);
        }
    }

    info!("fedcache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let hyper_directive = "hyper=warn"
        .parse::<tracing_subscriber::filter::Directive>()
        .map_err(|e| Error::Config(format!("invalid log directive: {}", e)))?;
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(hyper_directive);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP plumbing
// =============================================================================

type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

fn respond(
    status: hyper::StatusCode,
    content_type: &str,
    body: impl Into<hyper::body::Bytes>,
) -> HttpResponse {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn bind(addr: &str, name: &str) -> Result<tokio::net::TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, cache: Arc<ResultCache>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let cache = Arc::clone(&cache);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = cache.is_ready();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" => {
                            respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "cache not ready")
                        }
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<HttpResponse, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&prometheus::gather(), &mut buffer) {
                    Ok(()) => respond(StatusCode::OK, encoder.format_type(), buffer),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        format!("failed to encode metrics: {}", e),
                    ),
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
