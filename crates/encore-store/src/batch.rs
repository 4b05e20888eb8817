//! Batched append writer.
//!
//! High-frequency, low-value appends (play history) are not written one by
//! one. [`AppendBatcher::enqueue`] parks each value in a per-target queue;
//! a queue is written out as a single trimmed push when it reaches the size
//! limit, or when the [`BatchProcessor`] ticks.
//!
//! # Loss policy
//!
//! Queues live only in memory. A flush the store fails puts its values back
//! at the front of the queue (bounded by the size limit, oldest values
//! dropped first) and a clean shutdown always flushes everything, but a
//! process that dies mid-interval loses whatever was queued. For history
//! data that trade-off is intended. A flush the operator engine rejects is
//! not retried; its values are dropped and the error goes to the caller.
//!
//! # Locking
//!
//! The queue map has its own mutex, independent of the per-collection
//! cache locks. It is held across a flush so values reach the store in
//! enqueue order and no queue grows past its limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::DocumentCache;
use crate::document::{DocumentKey, FieldPath};
use crate::error::{StoreError, StoreResult};
use crate::ops::{TrimPolicy, UpdateOperation};

/// Caches by collection name.
pub type CacheMap = HashMap<String, Arc<DocumentCache>>;

/// Identifies one queue: a list field of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub collection: String,
    pub key: DocumentKey,
    pub path: FieldPath,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.collection, self.key, self.path)
    }
}

type Queues = HashMap<QueueKey, Vec<Value>>;

// ═══════════════════════════════════════════════════════════════════════
//  AppendBatcher
// ═══════════════════════════════════════════════════════════════════════

/// Per-target queues of pending list appends.
pub struct AppendBatcher {
    caches: Arc<CacheMap>,
    queues: Mutex<Queues>,
    size_limit: usize,
    keep_last: usize,
    flushes: AtomicU64,
    dropped: AtomicU64,
}

impl AppendBatcher {
    /// A batcher flushing into `caches`. `size_limit` is the queue length
    /// that forces a flush; flushed lists keep their last `keep_last` values.
    pub fn new(caches: Arc<CacheMap>, size_limit: usize, keep_last: usize) -> Self {
        Self {
            caches,
            queues: Mutex::new(HashMap::new()),
            size_limit: size_limit.max(1),
            keep_last,
            flushes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `value` for appending to `path` of `key` in `collection`.
    ///
    /// Flushes the queue before returning once it reaches the size limit.
    /// If that flush hits a store failure the values stay queued, the
    /// failure is logged and the value still counts as accepted. A flush
    /// rejected by the operator engine (the target is not a list, or the
    /// path runs through a non-mapping) can never succeed: the batch is
    /// discarded and the error returned.
    pub async fn enqueue(
        &self,
        collection: &str,
        key: DocumentKey,
        path: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.cache_for(collection)?;
        let target = QueueKey {
            collection: collection.to_string(),
            key,
            path: FieldPath::parse(path)?,
        };

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(target.clone()).or_default();
        queue.push(value);
        if queue.len() >= self.size_limit
            && let Err(err) = self.flush_locked(&mut queues, &target).await
        {
            if !is_transient(&err) {
                return Err(err);
            }
            warn!(queue = %target, error = %err, "size-triggered flush failed, values kept queued");
        }
        Ok(())
    }

    /// Write out the queue for `target`; returns how many values were written.
    pub async fn flush(&self, target: &QueueKey) -> StoreResult<usize> {
        let mut queues = self.queues.lock().await;
        self.flush_locked(&mut queues, target).await
    }

    /// Flush every non-empty queue.
    ///
    /// Every queue is attempted; if any flush failed, the last error is
    /// returned after the others have run.
    pub async fn flush_all(&self) -> StoreResult<usize> {
        let mut queues = self.queues.lock().await;
        let targets: Vec<QueueKey> = queues
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(target, _)| target.clone())
            .collect();

        let mut written = 0;
        let mut failure = None;
        for target in &targets {
            match self.flush_locked(&mut queues, target).await {
                Ok(n) => written += n,
                Err(err) => failure = Some(err),
            }
        }
        if !targets.is_empty() {
            debug!(queues = targets.len(), written, "flushed pending appends");
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Snapshot of the values queued for `target`.
    pub async fn pending_for(&self, target: &QueueKey) -> Vec<Value> {
        self.queues
            .lock()
            .await
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of queued values.
    pub async fn pending(&self) -> usize {
        self.queues.lock().await.values().map(Vec::len).sum()
    }

    /// Successful flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Values discarded: pushed out of a full requeue, or rejected outright.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn cache_for(&self, collection: &str) -> StoreResult<&Arc<DocumentCache>> {
        self.caches.get(collection).ok_or_else(|| StoreError::NotFound {
            entity: "collection",
            id: collection.to_string(),
        })
    }

    async fn flush_locked(&self, queues: &mut Queues, target: &QueueKey) -> StoreResult<usize> {
        let cache = self.cache_for(&target.collection)?;
        let values = match queues.get_mut(target) {
            Some(queue) if !queue.is_empty() => std::mem::take(queue),
            _ => return Ok(0),
        };
        let count = values.len();
        let op = UpdateOperation::Push {
            path: target.path.clone(),
            values,
            trim: Some(TrimPolicy::KeepLast(self.keep_last)),
        };

        match cache.mutate(&target.key, std::slice::from_ref(&op)).await {
            Ok(_) => {
                if queues.get(target).is_some_and(Vec::is_empty) {
                    queues.remove(target);
                }
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %target, count, "flushed appends");
                Ok(count)
            }
            Err(err) if is_transient(&err) => {
                if let UpdateOperation::Push { values, .. } = op {
                    let queue = queues.entry(target.clone()).or_default();
                    let dropped = requeue(queue, values, self.size_limit);
                    if dropped > 0 {
                        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                        warn!(queue = %target, dropped, "requeue over limit, oldest values dropped");
                    }
                }
                error!(queue = %target, count, error = %err, "flush failed, values requeued");
                Err(err)
            }
            Err(err) => {
                if queues.get(target).is_some_and(Vec::is_empty) {
                    queues.remove(target);
                }
                self.dropped.fetch_add(count as u64, Ordering::Relaxed);
                error!(queue = %target, count, error = %err, "flush rejected, values discarded");
                Err(err)
            }
        }
    }
}

/// Failures worth retrying: the store was unreachable, or the document
/// vanished and will be recreated from its template on the next load.
fn is_transient(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::StoreUnavailable { .. } | StoreError::NotFound { .. }
    )
}

/// Put `drained` back in front of `queue`, keeping at most `limit` values.
/// The oldest values go first; returns how many were dropped.
fn requeue(queue: &mut Vec<Value>, mut drained: Vec<Value>, limit: usize) -> usize {
    drained.append(queue);
    let dropped = drained.len().saturating_sub(limit);
    drained.drain(..dropped);
    *queue = drained;
    dropped
}

impl fmt::Debug for AppendBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendBatcher")
            .field("size_limit", &self.size_limit)
            .field("keep_last", &self.keep_last)
            .field("flushes", &self.flush_count())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  BatchProcessor
// ═══════════════════════════════════════════════════════════════════════

struct Running {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// The single background task: periodic `flush_all` plus periodic cache
/// sweeps.
pub struct BatchProcessor {
    batcher: Arc<AppendBatcher>,
    caches: Arc<CacheMap>,
    flush_interval: Duration,
    sweep_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl BatchProcessor {
    pub fn new(
        batcher: Arc<AppendBatcher>,
        caches: Arc<CacheMap>,
        flush_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            batcher,
            caches,
            flush_interval,
            sweep_interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the background loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("batch processor already running");
            return;
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.batcher),
            Arc::clone(&self.caches),
            self.flush_interval,
            self.sweep_interval,
            Arc::clone(&shutdown),
        ));
        *running = Some(Running { shutdown, handle });
        info!(
            flush_interval_secs = self.flush_interval.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "batch processor started"
        );
    }

    /// Stop the loop (if running) and flush every queue.
    ///
    /// Safe to call repeatedly or without a prior [`start`](Self::start):
    /// each call ends with a terminal `flush_all`.
    pub async fn stop(&self) -> StoreResult<usize> {
        let mut running = self.running.lock().await;
        if let Some(task) = running.take() {
            task.shutdown.notify_one();
            if let Err(e) = task.handle.await {
                error!(error = %e, "batch processor task panicked during shutdown");
            }
        }
        let result = self.batcher.flush_all().await;
        info!(clean = result.is_ok(), "batch processor stopped");
        result
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

async fn run_loop(
    batcher: Arc<AppendBatcher>,
    caches: Arc<CacheMap>,
    flush_interval: Duration,
    sweep_interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep_tick = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = flush_tick.tick() => {
                if let Err(err) = batcher.flush_all().await {
                    error!(error = %err, "periodic flush failed");
                }
            }
            _ = sweep_tick.tick() => {
                for cache in caches.values() {
                    cache.sweep().await;
                }
            }
        }
    }
    debug!("batch processor loop exited");
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::schema::{CollectionSchema, USERS};
    use serde_json::json;

    fn setup(size_limit: usize) -> (Arc<MemoryStore>, Arc<CacheMap>, AppendBatcher) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(DocumentCache::new(
            CollectionSchema::users(),
            Arc::clone(&store) as Arc<dyn crate::backend::DocumentStore>,
            Duration::from_secs(300),
            100,
        ));
        let caches = Arc::new(CacheMap::from([(USERS.to_string(), cache)]));
        let batcher = AppendBatcher::new(Arc::clone(&caches), size_limit, 25);
        (store, caches, batcher)
    }

    fn history(key: i64) -> QueueKey {
        QueueKey {
            collection: USERS.into(),
            key: DocumentKey::Int(key),
            path: FieldPath::parse("history").unwrap(),
        }
    }

    #[tokio::test]
    async fn below_threshold_does_not_flush() {
        let (store, _, batcher) = setup(5);
        for i in 0..4 {
            batcher.enqueue(USERS, DocumentKey::Int(42), "history", json!(i)).await.unwrap();
        }
        assert_eq!(batcher.flush_count(), 0);
        assert!(store.update_log().is_empty());
        assert_eq!(batcher.pending().await, 4);
    }

    #[tokio::test]
    async fn reaching_threshold_flushes_once_in_order() {
        let (store, _, batcher) = setup(5);
        for _ in 0..5 {
            batcher
                .enqueue(USERS, DocumentKey::Int(42), "history", json!("trackA"))
                .await
                .unwrap();
        }

        assert_eq!(batcher.flush_count(), 1);
        assert_eq!(batcher.pending().await, 0);
        let log = store.update_log();
        assert_eq!(log.len(), 1);
        let each = vec!["trackA"; 5];
        assert_eq!(
            log[0].1.to_value(),
            json!({ "$push": { "history": { "$each": each, "$slice": -25 } } })
        );
    }

    #[tokio::test]
    async fn flush_preserves_enqueue_order() {
        let (store, _, batcher) = setup(50);
        for i in 0..10 {
            batcher.enqueue(USERS, DocumentKey::Int(1), "history", json!(i)).await.unwrap();
        }
        assert_eq!(batcher.flush(&history(1)).await.unwrap(), 10);

        let stored = store.snapshot(&DocumentKey::Int(1)).unwrap();
        let expected: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        assert_eq!(stored["history"], Value::Array(expected));
    }

    #[tokio::test]
    async fn failed_flush_requeues_in_front() {
        let (store, _, batcher) = setup(50);
        batcher.enqueue(USERS, DocumentKey::Int(1), "history", json!("a")).await.unwrap();
        batcher.enqueue(USERS, DocumentKey::Int(1), "history", json!("b")).await.unwrap();

        store.fail_next(1);
        assert!(batcher.flush(&history(1)).await.is_err());
        batcher.enqueue(USERS, DocumentKey::Int(1), "history", json!("c")).await.unwrap();

        assert_eq!(
            batcher.pending_for(&history(1)).await,
            vec![json!("a"), json!("b"), json!("c")]
        );
        assert_eq!(batcher.flush_all().await.unwrap(), 3);
        assert_eq!(
            store.snapshot(&DocumentKey::Int(1)).unwrap()["history"],
            json!(["a", "b", "c"])
        );
    }

    #[tokio::test]
    async fn rejected_flush_is_reported_and_discarded() {
        let (store, _, batcher) = setup(3);
        let key = DocumentKey::Int(5);
        for i in 0..2 {
            batcher.enqueue(USERS, key.clone(), "playlist.200.name", json!(i)).await.unwrap();
        }
        let err = batcher
            .enqueue(USERS, key.clone(), "playlist.200.name", json!(2))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::TypeMismatch { expected: "list", .. }));
        assert_eq!(batcher.pending().await, 0);
        assert_eq!(batcher.dropped_count(), 3);
        assert!(store.update_log().is_empty());

        // The next batch for the same target starts from scratch.
        batcher.enqueue(USERS, key.clone(), "playlist.200.name", json!(3)).await.unwrap();
        assert!(batcher.flush_all().await.is_err());
        assert_eq!(batcher.flush_all().await.unwrap(), 0);

        batcher.enqueue(USERS, key.clone(), "history", json!("ok")).await.unwrap();
        assert_eq!(batcher.flush_all().await.unwrap(), 1);
        assert_eq!(
            store.snapshot(&key).unwrap()["playlist"]["200"]["name"],
            json!("Favourite")
        );
    }

    #[tokio::test]
    async fn store_failure_on_size_flush_keeps_values() {
        let (store, _, batcher) = setup(2);
        batcher.enqueue(USERS, DocumentKey::Int(1), "history", json!("a")).await.unwrap();
        store.fail_next(1);
        batcher.enqueue(USERS, DocumentKey::Int(1), "history", json!("b")).await.unwrap();

        assert_eq!(batcher.pending_for(&history(1)).await, vec![json!("a"), json!("b")]);
        assert_eq!(batcher.dropped_count(), 0);
    }

    #[test]
    fn requeue_drops_oldest_beyond_limit() {
        let mut queue = vec![json!(4), json!(5)];
        let dropped = requeue(&mut queue, vec![json!(1), json!(2), json!(3)], 4);
        assert_eq!(dropped, 1);
        assert_eq!(queue, vec![json!(2), json!(3), json!(4), json!(5)]);
    }

    #[tokio::test]
    async fn unknown_collection_is_not_found() {
        let (_, _, batcher) = setup(5);
        let err = batcher
            .enqueue("playlists", DocumentKey::Int(1), "history", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "collection", .. }));
        assert_eq!(batcher.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_flushes_on_timer() {
        let (store, caches, batcher) = setup(50);
        let batcher = Arc::new(batcher);
        let processor = BatchProcessor::new(
            Arc::clone(&batcher),
            caches,
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        processor.start().await;
        batcher.enqueue(USERS, DocumentKey::Int(9), "history", json!("x")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(store.update_log().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.update_log().len(), 1);

        processor.stop().await.unwrap();
        assert!(!processor.is_running().await);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_flushes() {
        let (store, caches, batcher) = setup(50);
        let batcher = Arc::new(batcher);
        let processor = BatchProcessor::new(
            Arc::clone(&batcher),
            caches,
            Duration::from_secs(30),
            Duration::from_secs(60),
        );

        // Stopping a processor that never started still flushes.
        batcher.enqueue(USERS, DocumentKey::Int(2), "history", json!("a")).await.unwrap();
        assert_eq!(processor.stop().await.unwrap(), 1);

        processor.start().await;
        processor.start().await;
        assert!(processor.is_running().await);
        batcher.enqueue(USERS, DocumentKey::Int(2), "history", json!("b")).await.unwrap();

        assert_eq!(processor.stop().await.unwrap(), 1);
        assert_eq!(processor.stop().await.unwrap(), 0);
        assert_eq!(
            store.snapshot(&DocumentKey::Int(2)).unwrap()["history"],
            json!(["a", "b"])
        );
    }
}
