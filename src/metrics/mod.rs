//! Metrics module
//!
//! Prometheus instrumentation for federated queries and the result cache.

pub mod collectors;

pub use collectors::init;
