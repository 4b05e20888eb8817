//! The upward-facing document service.
//!
//! [`DocumentService`] owns one [`DocumentCache`] per collection, the
//! shared [`AppendBatcher`], and the [`BatchProcessor`] that drives
//! flushing and sweeping. It is built once at startup, passed by reference
//! to whoever needs documents, and stopped at shutdown so pending appends
//! reach the store.
//!
//! Ordering: calls on one collection are serialized by that collection's
//! cache lock; calls on different collections are independent. Appends go
//! through the batcher's own lock and only meet the cache lock when a
//! queue is flushed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::backend::DocumentStore;
use crate::batch::{AppendBatcher, BatchProcessor, CacheMap};
use crate::cache::DocumentCache;
use crate::config::StoreConfig;
use crate::document::{Document, DocumentKey};
use crate::error::{StoreError, StoreResult};
use crate::ops::UpdateOperation;
use crate::schema::CollectionSchema;

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`DocumentService`].
pub struct DocumentServiceBuilder {
    config: StoreConfig,
    collections: Vec<(CollectionSchema, Arc<dyn DocumentStore>)>,
}

impl DocumentServiceBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a collection backed by `store`.
    pub fn collection(mut self, schema: CollectionSchema, store: Arc<dyn DocumentStore>) -> Self {
        self.collections.push((schema, store));
        self
    }

    /// Validate the configuration and assemble the service.
    pub fn build(self) -> StoreResult<DocumentService> {
        self.config.validate()?;
        if self.collections.is_empty() {
            return Err(StoreError::Config("no collections registered".into()));
        }

        let mut caches = HashMap::new();
        for (schema, store) in self.collections {
            let name = schema.name().to_string();
            let cache = DocumentCache::new(
                schema,
                store,
                self.config.cache_ttl(),
                self.config.max_cache_entries,
            );
            if caches.insert(name.clone(), Arc::new(cache)).is_some() {
                return Err(StoreError::Config(format!(
                    "collection `{name}` registered twice"
                )));
            }
        }

        let caches: Arc<CacheMap> = Arc::new(caches);
        let batcher = Arc::new(AppendBatcher::new(
            Arc::clone(&caches),
            self.config.batch_size_limit,
            self.config.history_keep_last,
        ));
        let processor = BatchProcessor::new(
            Arc::clone(&batcher),
            Arc::clone(&caches),
            self.config.batch_flush_interval(),
            self.config.sweep_interval(),
        );

        debug!(collections = caches.len(), "document service built");
        Ok(DocumentService {
            caches,
            batcher,
            processor,
            config: self.config,
        })
    }
}

// ── service ──────────────────────────────────────────────────────────

/// Cached, batched access to a set of document collections.
pub struct DocumentService {
    caches: Arc<CacheMap>,
    batcher: Arc<AppendBatcher>,
    processor: BatchProcessor,
    config: StoreConfig,
}

impl DocumentService {
    pub fn builder() -> DocumentServiceBuilder {
        DocumentServiceBuilder {
            config: StoreConfig::default(),
            collections: Vec::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The cache for `collection`.
    pub fn cache(&self, collection: &str) -> StoreResult<&Arc<DocumentCache>> {
        self.caches.get(collection).ok_or_else(|| StoreError::NotFound {
            entity: "collection",
            id: collection.to_string(),
        })
    }

    /// Registered collection names, sorted.
    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.caches.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn batcher(&self) -> &AppendBatcher {
        &self.batcher
    }

    /// Fetch a document, loading or creating it on a miss. `refresh`
    /// bypasses the cached copy.
    pub async fn get(
        &self,
        collection: &str,
        key: &DocumentKey,
        refresh: bool,
    ) -> StoreResult<Document> {
        self.cache(collection)?.get(key, refresh).await
    }

    /// The cached copy of a document, without touching the store.
    pub async fn peek(&self, collection: &str, key: &DocumentKey) -> StoreResult<Option<Document>> {
        Ok(self.cache(collection)?.peek(key).await)
    }

    /// One top-level template field of a document.
    ///
    /// Fields outside the collection's template are `NotFound`; a template
    /// field missing from the stored document yields the template default.
    #[instrument(skip(self))]
    pub async fn get_field(
        &self,
        collection: &str,
        key: &DocumentKey,
        field: &str,
    ) -> StoreResult<Value> {
        let cache = self.cache(collection)?;
        let default = cache
            .schema()
            .field_default(field)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "field",
                id: format!("{collection}.{field}"),
            })?;
        let mut document = cache.get(key, false).await?;
        Ok(document.remove(field).unwrap_or(default))
    }

    /// Apply `ops` to a document; returns whether the store reported a change.
    pub async fn mutate(
        &self,
        collection: &str,
        key: &DocumentKey,
        ops: &[UpdateOperation],
    ) -> StoreResult<bool> {
        self.cache(collection)?.mutate(key, ops).await
    }

    /// Delete a document from the store and the cache.
    pub async fn delete(&self, collection: &str, key: &DocumentKey) -> StoreResult<bool> {
        self.cache(collection)?.delete(key).await
    }

    /// Queue `value` for appending to the list at `field_path`.
    pub async fn enqueue_append(
        &self,
        collection: &str,
        key: DocumentKey,
        field_path: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.batcher.enqueue(collection, key, field_path, value).await
    }

    /// Start the background flush/sweep task. Idempotent.
    pub async fn start_batch_processor(&self) {
        self.processor.start().await;
    }

    /// Stop the background task and flush all pending appends. Idempotent.
    pub async fn stop_batch_processor(&self) -> StoreResult<usize> {
        self.processor.stop().await
    }

    pub async fn is_processor_running(&self) -> bool {
        self.processor.is_running().await
    }

    /// Run a TTL and capacity sweep over every collection now.
    pub async fn sweep(&self) -> usize {
        let mut evicted = 0;
        for cache in self.caches.values() {
            evicted += cache.sweep().await;
        }
        evicted
    }
}

impl std::fmt::Debug for DocumentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentService")
            .field("collections", &self.collections())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ── tests ────────────────────────────────────────────────────────────
