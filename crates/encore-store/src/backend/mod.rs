//! The abstract document store and its implementations.
//!
//! The cache talks to the outside world only through [`DocumentStore`]:
//! four key-based calls, no queries, no transactions. Two backends ship
//! with the crate:
//!
//! - [`MemoryStore`] keeps documents in a map and records every update it
//!   receives; it can be told to fail, which makes it the test double of
//!   choice.
//! - [`SqliteStore`] persists documents as JSON rows in SQLite.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{Document, DocumentKey};
use crate::error::{BackendError, BackendResult};
use crate::ops::{self, NativeUpdate};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Outcome of [`DocumentStore::update_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// Whether a document matched the key.
    pub matched: bool,
    /// Whether the matched document actually changed.
    pub modified: bool,
}

/// Key-based access to one collection of a remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the document stored under `key`.
    async fn find_one(&self, key: &DocumentKey) -> BackendResult<Option<Document>>;

    /// Insert a new document; its key is read from the `_id` field.
    async fn insert_one(&self, doc: &Document) -> BackendResult<()>;

    /// Apply a native update expression to the document under `key`.
    async fn update_one(&self, key: &DocumentKey, update: &NativeUpdate)
    -> BackendResult<UpdateResult>;

    /// Delete the document under `key`; returns whether one was removed.
    async fn delete_one(&self, key: &DocumentKey) -> BackendResult<bool>;
}

/// Apply `update` to `doc` the way a store would, reporting whether it changed.
///
/// Shared by the bundled backends so they interpret the native syntax with
/// the same engine the cache uses.
pub(crate) fn apply_native(doc: &Document, update: &NativeUpdate) -> BackendResult<(Document, bool)> {
    let ops = ops::decode_native(update).map_err(|e| BackendError::Rejected(e.to_string()))?;
    let (updated, _) = ops::apply(doc, &ops).map_err(|e| BackendError::Rejected(e.to_string()))?;
    let modified = &updated != doc;
    Ok((updated, modified))
}
