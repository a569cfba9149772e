//! In-Memory Document Store Adapter
//!
//! Implements the `DocumentStore` port with commit semantics: added documents
//! sit in a pending set and become queryable only after `commit`. Deletes are
//! applied to both sets immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::{CachedDocument, DocumentKey, DocumentStore, StoreQuery, StoreQueryResult};
use crate::error::{Error, Result};
use crate::federation::SortPolicy;

/// In-memory store, also used as the test double for the cache
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    pending: DashMap<DocumentKey, CachedDocument>,
    committed: RwLock<HashMap<DocumentKey, CachedDocument>>,
    add_calls: AtomicU64,
    documents_written: AtomicU64,
    commits: AtomicU64,
    fail_writes: AtomicBool,
    fail_commits: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `add` calls fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `commit` calls fail
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn committed_len(&self) -> usize {
        self.committed.read().len()
    }

    /// Committed copy of a document
    pub fn get(&self, key: &DocumentKey) -> Option<CachedDocument> {
        self.committed.read().get(key).cloned()
    }

    pub fn add_calls(&self) -> u64 {
        self.add_calls.load(Ordering::Relaxed)
    }

    /// Total documents received across all `add` calls
    pub fn documents_written(&self) -> u64 {
        self.documents_written.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn query(&self, query: &StoreQuery) -> Result<StoreQueryResult> {
        let mut matches: Vec<CachedDocument> = self
            .committed
            .read()
            .values()
            .filter(|doc| {
                query.source_ids.is_empty() || query.source_ids.contains(&doc.metacard.source_id)
            })
            .filter(|doc| query.filter.matches(&doc.metacard))
            .cloned()
            .collect();

        let policy = SortPolicy::for_sort(query.sort.as_ref());
        matches.sort_by(|a, b| policy.compare_metacards(&a.metacard, &b.metacard));

        let total_hits = matches.len() as u64;
        let skip = query.start_index.saturating_sub(1);
        let take = if query.page_size == 0 {
            usize::MAX
        } else {
            query.page_size
        };
        let documents = matches.into_iter().skip(skip).take(take).collect();

        Ok(StoreQueryResult {
            documents,
            total_hits,
        })
    }

    async fn add(&self, documents: Vec<CachedDocument>) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::CacheWrite("store rejected write".to_string()));
        }

        self.documents_written
            .fetch_add(documents.len() as u64, Ordering::Relaxed);
        for doc in documents {
            self.pending.insert(doc.metacard.key(), doc);
        }
        Ok(())
    }

    async fn delete_by_attribute(
        &self,
        attribute: &str,
        values: &[serde_json::Value],
    ) -> Result<u64> {
        let matches = |doc: &CachedDocument| {
            doc.metacard
                .attribute(attribute)
                .map(|v| values.contains(&v))
                .unwrap_or(false)
        };

        let before = self.pending.len();
        self.pending.retain(|_, doc| !matches(doc));
        let mut removed = (before - self.pending.len()) as u64;

        let mut committed = self.committed.write();
        let before = committed.len();
        committed.retain(|_, doc| !matches(doc));
        removed += (before - committed.len()) as u64;

        Ok(removed)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.pending.len();
        self.pending.retain(|_, doc| doc.cached_at >= cutoff);
        let mut removed = (before - self.pending.len()) as u64;

        let mut committed = self.committed.write();
        let before = committed.len();
        committed.retain(|_, doc| doc.cached_at >= cutoff);
        removed += (before - committed.len()) as u64;

        Ok(removed)
    }

    async fn commit(&self) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::CacheWrite("store rejected commit".to_string()));
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<DocumentKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut committed = self.committed.write();
        for key in keys {
            if let Some((key, doc)) = self.pending.remove(&key) {
                committed.insert(key, doc);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{match_all, IdIn, Metacard, SortBy, SortOrder};
    use chrono::Duration;
    use std::sync::Arc;

    fn query_all() -> StoreQuery {
        StoreQuery {
            filter: match_all(),
            source_ids: vec![],
            start_index: 1,
            page_size: 0,
            sort: None,
        }
    }

    fn doc(id: &str, source: &str) -> CachedDocument {
        CachedDocument::new(Metacard::new(id, source))
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = InMemoryDocumentStore::new();
        store.add(vec![doc("a", "s1")]).await.unwrap();

        assert_eq!(store.query(&query_all()).await.unwrap().total_hits, 0);
        assert_eq!(store.pending_len(), 1);

        store.commit().await.unwrap();
        assert_eq!(store.query(&query_all()).await.unwrap().total_hits, 1);
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keyed_by_source_and_id() {
        let store = InMemoryDocumentStore::new();
        store.add(vec![doc("a", "s1"), doc("a", "s2")]).await.unwrap();
        store
            .add(vec![CachedDocument::new(
                Metacard::new("a", "s1").with_title("second"),
            )])
            .await
            .unwrap();
        store.commit().await.unwrap();

        assert_eq!(store.committed_len(), 2);
        let updated = store.get(&DocumentKey::new("s1", "a")).unwrap();
        assert_eq!(updated.metacard.title.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_query_scopes_filters_and_windows() {
        let store = InMemoryDocumentStore::new();
        let docs = (0..6)
            .map(|i| {
                let source = if i % 2 == 0 { "even" } else { "odd" };
                CachedDocument::new(
                    Metacard::new(format!("doc-{}", i), source)
                        .with_effective(Utc::now() - Duration::days(i)),
                )
            })
            .collect();
        store.add(docs).await.unwrap();
        store.commit().await.unwrap();

        let mut query = query_all();
        query.source_ids = vec!["even".to_string()];
        query.sort = Some(SortBy::temporal(SortOrder::Descending));
        let result = store.query(&query).await.unwrap();
        assert_eq!(result.total_hits, 3);
        let ids: Vec<&str> = result.documents.iter().map(|d| d.metacard.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-0", "doc-2", "doc-4"]);

        query.start_index = 2;
        query.page_size = 1;
        let result = store.query(&query).await.unwrap();
        assert_eq!(result.total_hits, 3);
        assert_eq!(result.documents[0].metacard.id, "doc-2");

        let mut by_id = query_all();
        by_id.filter = Arc::new(IdIn::new(["doc-5"]));
        assert_eq!(store.query(&by_id).await.unwrap().total_hits, 1);
    }

    #[tokio::test]
    async fn test_delete_by_attribute_and_age() {
        let store = InMemoryDocumentStore::new();
        let mut stale = doc("old", "s1");
        stale.cached_at = Utc::now() - Duration::days(10);
        store.add(vec![stale, doc("new", "s1"), doc("x", "s2")]).await.unwrap();
        store.commit().await.unwrap();

        let removed = store
            .delete_older_than(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let removed = store
            .delete_by_attribute("source-id", &[serde_json::json!("s2")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.committed_len(), 1);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let store = InMemoryDocumentStore::new();
        store.set_fail_writes(true);
        assert!(store.add(vec![doc("a", "s")]).await.is_err());

        store.set_fail_writes(false);
        store.set_fail_commits(true);
        store.add(vec![doc("a", "s")]).await.unwrap();
        assert!(store.commit().await.is_err());
        assert_eq!(store.committed_len(), 0);
    }
}
