//! Per-collection document cache.
//!
//! A [`DocumentCache`] mirrors one collection of a [`DocumentStore`] in
//! process. A single async mutex per collection serializes loads,
//! mutations and sweeps, so every caller observes one order of updates
//! per collection and capacity eviction always sees a consistent view.
//!
//! Mutations run the operator engine against a working copy, send the
//! matching native update to the store, and only commit the copy once the
//! store has accepted it. If the store fails, the key is evicted so the
//! next access reloads from the store instead of trusting memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::DocumentStore;
use crate::document::{Document, DocumentKey};
use crate::error::{BackendError, StoreError, StoreResult};
use crate::ops::{self, UpdateOperation};
use crate::schema::CollectionSchema;

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Lookups served from memory.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that went to the store.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped by sweeps or rollbacks.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate between 0.0 and 1.0 (0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.evictions(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── entries ──────────────────────────────────────────────────────────

/// A cached document and the last time anyone touched it.
#[derive(Debug, Clone)]
struct CacheEntry {
    document: Document,
    last_access: Instant,
}

impl CacheEntry {
    fn new(document: Document) -> Self {
        Self {
            document,
            last_access: Instant::now(),
        }
    }
}

type Entries = HashMap<DocumentKey, CacheEntry>;

// ── cache ────────────────────────────────────────────────────────────

/// In-process mirror of one collection.
pub struct DocumentCache {
    schema: CollectionSchema,
    store: Arc<dyn DocumentStore>,
    entries: Mutex<Entries>,
    ttl: Duration,
    max_entries: usize,
    stats: CacheStats,
}

impl DocumentCache {
    pub fn new(
        schema: CollectionSchema,
        store: Arc<dyn DocumentStore>,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        debug!(
            collection = schema.name(),
            ttl_secs = ttl.as_secs(),
            max_entries,
            "document cache created"
        );
        Self {
            schema,
            store,
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            stats: CacheStats::default(),
        }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Return the document for `key`, loading (or creating) it on a miss.
    pub async fn get_or_load(&self, key: &DocumentKey) -> StoreResult<Document> {
        self.get(key, false).await
    }

    /// Like [`get_or_load`](Self::get_or_load); `refresh` forces a reload
    /// from the store even when the key is cached.
    #[instrument(skip(self), fields(collection = %self.name()))]
    pub async fn get(&self, key: &DocumentKey, refresh: bool) -> StoreResult<Document> {
        let mut entries = self.entries.lock().await;
        self.load_locked(&mut entries, key, refresh).await
    }

    /// The cached copy of `key`, if any. Never touches the store and does
    /// not refresh the access time.
    pub async fn peek(&self, key: &DocumentKey) -> Option<Document> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|entry| entry.document.clone())
    }

    /// Apply `ops` to the document under `key` in memory and in the store.
    ///
    /// Returns whether the store reported the document as changed. Operator
    /// errors leave the cached entry untouched; store errors evict it. An empty
    /// batch returns `false` without loading anything.
    #[instrument(skip(self, ops), fields(collection = %self.name(), ops = ops.len()))]
    pub async fn mutate(&self, key: &DocumentKey, ops: &[UpdateOperation]) -> StoreResult<bool> {
        if ops.is_empty() {
            return Ok(false);
        }
        let mut entries = self.entries.lock().await;
        let current = self.load_locked(&mut entries, key, false).await?;

        let (updated, native) = ops::apply(&current, ops)?;

        match self.store.update_one(key, &native).await {
            Ok(result) if result.matched => {
                entries.insert(key.clone(), CacheEntry::new(updated));
                debug!(key = %key, modified = result.modified, "mutation committed");
                Ok(result.modified)
            }
            Ok(_) => {
                entries.remove(key);
                self.stats.record_evictions(1);
                warn!(key = %key, "document missing from store, cache entry evicted");
                Err(StoreError::NotFound {
                    entity: "document",
                    id: format!("{}/{key}", self.name()),
                })
            }
            Err(source) => {
                entries.remove(key);
                self.stats.record_evictions(1);
                warn!(key = %key, error = %source, "store update failed, cache entry evicted");
                Err(self.unavailable(key, source))
            }
        }
    }

    /// Delete `key` from the store and the cache.
    #[instrument(skip(self), fields(collection = %self.name()))]
    pub async fn delete(&self, key: &DocumentKey) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let result = self.store.delete_one(key).await;
        entries.remove(key);
        result.map_err(|source| self.unavailable(key, source))
    }

    /// Drop the cached entry for `key`, if any.
    pub async fn invalidate(&self, key: &DocumentKey) {
        self.entries.lock().await.remove(key);
        debug!(collection = self.name(), key = %key, "cache invalidate");
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
        debug!(collection = self.name(), "cache cleared");
    }

    /// Drop entries unaccessed for longer than the TTL.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        self.evict_expired_locked(&mut entries)
    }

    /// Drop least-recently-accessed entries until within capacity.
    pub async fn evict_over_capacity(&self) -> usize {
        let mut entries = self.entries.lock().await;
        self.evict_over_capacity_locked(&mut entries)
    }

    /// TTL sweep followed by capacity eviction, under one lock hold.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let expired = self.evict_expired_locked(&mut entries);
        let over = self.evict_over_capacity_locked(&mut entries);
        if expired + over > 0 {
            info!(
                collection = self.name(),
                expired,
                over_capacity = over,
                remaining = entries.len(),
                "cache sweep completed"
            );
        }
        expired + over
    }

    // ── internals ────────────────────────────────────────────────────

    async fn load_locked(
        &self,
        entries: &mut Entries,
        key: &DocumentKey,
        refresh: bool,
    ) -> StoreResult<Document> {
        if !refresh && let Some(entry) = entries.get_mut(key) {
            entry.last_access = Instant::now();
            self.stats.record_hit();
            debug!(collection = self.name(), key = %key, "cache hit");
            return Ok(entry.document.clone());
        }

        self.stats.record_miss();
        debug!(collection = self.name(), key = %key, refresh, "cache miss");
        let document = match self.fetch_or_create(key).await {
            Ok(document) => document,
            Err(err) => {
                entries.remove(key);
                return Err(err);
            }
        };
        entries.insert(key.clone(), CacheEntry::new(document.clone()));
        Ok(document)
    }

    /// Read `key` from the store, persisting a template copy if it is absent.
    async fn fetch_or_create(&self, key: &DocumentKey) -> StoreResult<Document> {
        let found = self
            .store
            .find_one(key)
            .await
            .map_err(|source| self.unavailable(key, source))?;
        if let Some(document) = found {
            return Ok(document);
        }

        let document = self.schema.instantiate(key);
        match self.store.insert_one(&document).await {
            Ok(()) => {
                debug!(collection = self.name(), key = %key, "document created from template");
                Ok(document)
            }
            // Someone else created it between our find and insert.
            Err(BackendError::Duplicate { .. }) => self
                .store
                .find_one(key)
                .await
                .map_err(|source| self.unavailable(key, source))?
                .ok_or_else(|| {
                    self.unavailable(
                        key,
                        BackendError::Unavailable("document vanished after duplicate insert".into()),
                    )
                }),
            Err(source) => Err(self.unavailable(key, source)),
        }
    }

    fn evict_expired_locked(&self, entries: &mut Entries) -> usize {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_access) <= self.ttl);
        let removed = before - entries.len();
        self.stats.record_evictions(removed);
        removed
    }

    fn evict_over_capacity_locked(&self, entries: &mut Entries) -> usize {
        let excess = entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(Instant, DocumentKey)> = entries
            .iter()
            .map(|(key, entry)| (entry.last_access, key.clone()))
            .collect();
        by_age.sort_unstable();
        for (_, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
            warn!(collection = self.name(), key = %key, "cache over capacity, evicted oldest entry");
        }
        self.stats.record_evictions(excess);
        excess
    }

    fn unavailable(&self, key: &DocumentKey, source: BackendError) -> StoreError {
        StoreError::StoreUnavailable {
            collection: self.name().to_string(),
            key: key.to_string(),
            source,
        }
    }
}

impl fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentCache")
            .field("collection", &self.name())
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryStore, UpdateResult};
    use crate::error::BackendResult;
    use crate::ops::{NativeUpdate, TrimPolicy};
    use async_trait::async_trait;
    use serde_json::json;

    fn cache_over(store: Arc<MemoryStore>, max_entries: usize) -> DocumentCache {
        DocumentCache::new(
            CollectionSchema::users(),
            store,
            Duration::from_secs(300),
            max_entries,
        )
    }

    fn key(n: i64) -> DocumentKey {
        DocumentKey::Int(n)
    }

    #[tokio::test]
    async fn miss_creates_document_from_template() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);

        let doc = cache.get_or_load(&key(42)).await.unwrap();
        assert_eq!(doc["_id"], json!(42));
        assert_eq!(doc["history"], json!([]));
        assert_eq!(store.snapshot(&key(42)), Some(doc));
    }

    #[tokio::test]
    async fn hit_does_not_touch_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);

        cache.get_or_load(&key(1)).await.unwrap();
        cache.get_or_load(&key(1)).await.unwrap();

        assert_eq!(store.find_count(), 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn refresh_reloads_from_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache.get_or_load(&key(1)).await.unwrap();

        let mut external = store.snapshot(&key(1)).unwrap();
        external.insert("dj".into(), json!(99));
        store.seed(key(1), external);

        assert!(!cache.get(&key(1), false).await.unwrap().contains_key("dj"));
        assert_eq!(cache.get(&key(1), true).await.unwrap()["dj"], json!(99));
    }

    #[tokio::test]
    async fn increment_twice() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        let op = [UpdateOperation::increment("count", 1).unwrap()];

        assert!(cache.mutate(&key(3), &op).await.unwrap());
        assert_eq!(cache.get_or_load(&key(3)).await.unwrap()["count"], json!(1));
        cache.mutate(&key(3), &op).await.unwrap();
        assert_eq!(cache.get_or_load(&key(3)).await.unwrap()["count"], json!(2));
        assert_eq!(store.snapshot(&key(3)).unwrap()["count"], json!(2));
    }

    #[tokio::test]
    async fn push_with_trim_matches_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache
            .mutate(&key(5), &[UpdateOperation::set("tags", json!(["a", "b", "c"])).unwrap()])
            .await
            .unwrap();

        let push = UpdateOperation::push("tags", vec![json!("x")], Some(TrimPolicy::KeepLast(3))).unwrap();
        cache.mutate(&key(5), &[push]).await.unwrap();

        let cached = cache.get_or_load(&key(5)).await.unwrap();
        assert_eq!(cached["tags"], json!(["b", "c", "x"]));
        assert_eq!(store.snapshot(&key(5)).unwrap(), cached);
    }

    #[tokio::test]
    async fn type_mismatch_leaves_entry_untouched() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache.get_or_load(&key(8)).await.unwrap();
        let before = cache.peek(&key(8)).await.unwrap();

        let ops = [
            UpdateOperation::set("volume", 50).unwrap(),
            UpdateOperation::increment("inbox", 1).unwrap(),
        ];
        let err = cache.mutate(&key(8), &ops).await.unwrap_err();

        assert!(matches!(err, StoreError::TypeMismatch { .. }));
        assert_eq!(cache.peek(&key(8)).await.unwrap(), before);
        assert!(store.update_log().is_empty());
    }

    #[tokio::test]
    async fn store_failure_evicts_and_forces_reload() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache.get_or_load(&key(7)).await.unwrap();

        store.fail_next(1);
        let err = cache
            .mutate(&key(7), &[UpdateOperation::set("lang", "DE").unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StoreUnavailable { .. }));
        assert!(cache.peek(&key(7)).await.is_none());

        let finds_before = store.find_count();
        let reloaded = cache.get_or_load(&key(7)).await.unwrap();
        assert_eq!(store.find_count(), finds_before + 1);
        assert!(!reloaded.contains_key("lang"));
    }

    #[tokio::test]
    async fn failed_load_caches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        store.fail_next(1);
        assert!(cache.get_or_load(&key(1)).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn externally_deleted_document_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache.get_or_load(&key(2)).await.unwrap();
        store.delete_one(&key(2)).await.unwrap();

        let err = cache
            .mutate(&key(2), &[UpdateOperation::set("a", 1).unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(cache.peek(&key(2)).await.is_none());
    }

    #[tokio::test]
    async fn delete_drops_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache.get_or_load(&key(4)).await.unwrap();

        assert!(cache.delete(&key(4)).await.unwrap());
        assert!(cache.peek(&key(4)).await.is_none());
        assert!(store.snapshot(&key(4)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_sweep_drops_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        cache.get_or_load(&key(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.get_or_load(&key(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(cache.evict_expired().await, 1);
        assert!(cache.peek(&key(1)).await.is_none());
        assert!(cache.peek(&key(2)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_eviction_drops_least_recently_accessed() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 2);
        for n in 1..=3 {
            cache.get_or_load(&key(n)).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // Touch 1 so 2 becomes the oldest.
        cache.get_or_load(&key(1)).await.unwrap();

        assert_eq!(cache.evict_over_capacity().await, 1);
        assert!(cache.peek(&key(2)).await.is_none());
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_then_trims_to_capacity() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 1);
        cache.get_or_load(&key(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(400)).await;
        cache.get_or_load(&key(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get_or_load(&key(3)).await.unwrap();

        assert_eq!(cache.sweep().await, 2);
        assert!(cache.peek(&key(1)).await.is_none());
        assert!(cache.peek(&key(2)).await.is_none());
        assert!(cache.peek(&key(3)).await.is_some());
        assert_eq!(cache.stats().evictions(), 2);
    }

    #[tokio::test]
    async fn invalidate_and_clear_force_reloads() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);
        for n in 1..=3 {
            cache.get_or_load(&key(n)).await.unwrap();
        }

        cache.invalidate(&key(1)).await;
        assert!(cache.peek(&key(1)).await.is_none());
        assert_eq!(cache.len().await, 2);

        cache.clear().await;
        assert!(cache.is_empty().await);

        let finds = store.find_count();
        cache.get_or_load(&key(2)).await.unwrap();
        assert_eq!(store.find_count(), finds + 1);
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), 100);

        assert!(!cache.mutate(&key(9), &[]).await.unwrap());
        assert_eq!(store.find_count(), 0);
        assert!(store.snapshot(&key(9)).is_none());
        assert!(cache.is_empty().await);
    }

    /// Another writer creates the document between our find and insert.
    struct RacingStore {
        inner: MemoryStore,
        rival: Document,
    }

    #[async_trait]
    impl DocumentStore for RacingStore {
        async fn find_one(&self, key: &DocumentKey) -> BackendResult<Option<Document>> {
            self.inner.find_one(key).await
        }

        async fn insert_one(&self, doc: &Document) -> BackendResult<()> {
            let rival_key = DocumentKey::from_document(&self.rival).unwrap();
            self.inner.seed(rival_key, self.rival.clone());
            self.inner.insert_one(doc).await
        }

        async fn update_one(
            &self,
            key: &DocumentKey,
            update: &NativeUpdate,
        ) -> BackendResult<UpdateResult> {
            self.inner.update_one(key, update).await
        }

        async fn delete_one(&self, key: &DocumentKey) -> BackendResult<bool> {
            self.inner.delete_one(key).await
        }
    }

    #[tokio::test]
    async fn duplicate_insert_rereads_winner() {
        let mut rival = CollectionSchema::users().instantiate(&key(6));
        rival.insert("history".into(), json!(["rival"]));
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            rival: rival.clone(),
        });
        let cache = DocumentCache::new(
            CollectionSchema::users(),
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Duration::from_secs(300),
            100,
        );

        let doc = cache.get_or_load(&key(6)).await.unwrap();
        assert_eq!(doc, rival);
        assert_eq!(store.inner.find_count(), 2);
        assert_eq!(cache.peek(&key(6)).await, Some(rival));
    }

    #[test]
    fn stats_display() {
        let stats = CacheStats::default();
        stats.hits.store(50, Ordering::Relaxed);
        stats.misses.store(50, Ordering::Relaxed);
        let display = format!("{stats}");
        assert!(display.contains("hits=50"));
        assert!(display.contains("50.00%"));
        stats.reset();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
