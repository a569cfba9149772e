//! Cache Source Adapter
//!
//! Presents the result cache through the `Source` port so cache-mode requests
//! run through the same executor and monitor as live federation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{ResultCache, CACHE_SOURCE_ID};
use crate::domain::{QueryRequest, Source, SourceResponse};
use crate::error::Result;

/// The result cache as a pseudo-source
pub struct CacheSource {
    cache: Arc<ResultCache>,
}

impl CacheSource {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Source for CacheSource {
    fn id(&self) -> &str {
        CACHE_SOURCE_ID
    }

    /// Unavailable until the cache has a backing store
    async fn is_available(&self) -> bool {
        self.cache.is_ready()
    }

    async fn query(&self, request: &QueryRequest) -> Result<SourceResponse> {
        self.cache.query(request).await
    }
}
