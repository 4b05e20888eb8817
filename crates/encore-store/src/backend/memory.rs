//! In-process [`DocumentStore`] backed by a map.
//!
//! Besides being a usable store for single-process deployments, the
//! [`MemoryStore`] keeps a log of every native update it applied and can be
//! armed to fail the next `n` calls with [`BackendError::Unavailable`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{DocumentStore, UpdateResult, apply_native};
use crate::document::{Document, DocumentKey};
use crate::error::{BackendError, BackendResult};
use crate::ops::NativeUpdate;

/// A map-backed document store with an update log and fault injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DocumentKey, Document>>,
    updates: Mutex<Vec<(DocumentKey, NativeUpdate)>>,
    finds: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls (of any kind) fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Every update applied so far, oldest first.
    pub fn update_log(&self) -> Vec<(DocumentKey, NativeUpdate)> {
        lock(&self.updates).clone()
    }

    /// Number of `find_one` calls served.
    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored document under `key`.
    pub fn snapshot(&self, key: &DocumentKey) -> Option<Document> {
        lock(&self.docs).get(key).cloned()
    }

    /// Store `doc` directly, bypassing the update path.
    pub fn seed(&self, key: DocumentKey, doc: Document) {
        lock(&self.docs).insert(key, doc);
    }

    fn check_fault(&self) -> BackendResult<()> {
        let armed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match armed {
            Ok(_) => Err(BackendError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, key: &DocumentKey) -> BackendResult<Option<Document>> {
        self.check_fault()?;
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.docs).get(key).cloned())
    }

    async fn insert_one(&self, doc: &Document) -> BackendResult<()> {
        self.check_fault()?;
        let key = DocumentKey::from_document(doc)
            .ok_or_else(|| BackendError::Rejected("document has no usable `_id`".into()))?;
        let mut docs = lock(&self.docs);
        if docs.contains_key(&key) {
            return Err(BackendError::Duplicate { id: key.to_string() });
        }
        debug!(key = %key, "memory store insert");
        docs.insert(key, doc.clone());
        Ok(())
    }

    async fn update_one(
        &self,
        key: &DocumentKey,
        update: &NativeUpdate,
    ) -> BackendResult<UpdateResult> {
        self.check_fault()?;
        let mut docs = lock(&self.docs);
        let Some(current) = docs.get(key) else {
            return Ok(UpdateResult {
                matched: false,
                modified: false,
            });
        };
        let (updated, modified) = apply_native(current, update)?;
        docs.insert(key.clone(), updated);
        lock(&self.updates).push((key.clone(), update.clone()));
        Ok(UpdateResult {
            matched: true,
            modified,
        })
    }

    async fn delete_one(&self, key: &DocumentKey) -> BackendResult<bool> {
        self.check_fault()?;
        Ok(lock(&self.docs).remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{TrimPolicy, UpdateOperation, apply};
    use serde_json::json;

    fn doc_for(key: i64) -> Document {
        let mut doc = Document::new();
        doc.insert("_id".into(), json!(key));
        doc
    }

    #[tokio::test]
    async fn insert_find_delete() {
        let store = MemoryStore::new();
        let key = DocumentKey::Int(1);
        store.insert_one(&doc_for(1)).await.unwrap();

        assert!(store.find_one(&key).await.unwrap().is_some());
        assert!(matches!(
            store.insert_one(&doc_for(1)).await,
            Err(BackendError::Duplicate { .. })
        ));
        assert!(store.delete_one(&key).await.unwrap());
        assert!(!store.delete_one(&key).await.unwrap());
        assert!(store.find_one(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_applies_native_expression() {
        let store = MemoryStore::new();
        let key = DocumentKey::Int(5);
        store.insert_one(&doc_for(5)).await.unwrap();

        let ops = [UpdateOperation::push("history", vec![json!("a")], Some(TrimPolicy::KeepLast(2))).unwrap()];
        let (_, native) = apply(&doc_for(5), &ops).unwrap();

        let result = store.update_one(&key, &native).await.unwrap();
        assert!(result.matched && result.modified);
        assert_eq!(store.snapshot(&key).unwrap()["history"], json!(["a"]));
        assert_eq!(store.update_log().len(), 1);
    }

    #[tokio::test]
    async fn update_of_missing_document_matches_nothing() {
        let store = MemoryStore::new();
        let (_, native) = apply(&Document::new(), &[UpdateOperation::set("a", 1).unwrap()]).unwrap();
        let result = store.update_one(&DocumentKey::Int(9), &native).await.unwrap();
        assert!(!result.matched);
        assert!(store.update_log().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_counted_down() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let key = DocumentKey::Int(1);
        assert!(store.find_one(&key).await.is_err());
        assert!(store.find_one(&key).await.is_err());
        assert!(store.find_one(&key).await.is_ok());
        assert_eq!(store.find_count(), 1);
    }
}
