//! # encore-store
//!
//! Document cache and batched write-back layer for Encore.
//!
//! Keeps an in-process mirror of per-guild and per-user documents
//! consistent with a remote document store, applies one small algebra of
//! update operators to both sides, and folds bursts of history appends
//! into periodic, bounded batch writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  DocumentService (per-collection routing)   │
//! ├──────────────────────┬──────────────────────┤
//! │  AppendBatcher       │  BatchProcessor      │
//! │  (queue lock)        │  (flush + sweep)     │
//! ├──────────────────────┴──────────────────────┤
//! │  DocumentCache (one lock per collection)    │
//! │  Operator engine (memory + native update)   │
//! ├─────────────────────────────────────────────┤
//! │  DocumentStore: MemoryStore | SqliteStore   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use encore_store::{CollectionSchema, DocumentKey, DocumentService, MemoryStore, UpdateOperation};
//!
//! let service = DocumentService::builder()
//!     .collection(CollectionSchema::users(), Arc::new(MemoryStore::new()))
//!     .build()?;
//! service.start_batch_processor().await;
//!
//! let key = DocumentKey::Int(42);
//! service.mutate("users", &key, &[UpdateOperation::increment("plays", 1)?]).await?;
//! service.enqueue_append("users", key, "history", "track-id".into()).await?;
//!
//! service.stop_batch_processor().await?;
//! ```

pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod migration;
pub mod ops;
pub mod schema;
pub mod service;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{DocumentStore, MemoryStore, SqliteStore, UpdateResult};
pub use batch::{AppendBatcher, BatchProcessor, QueueKey};
pub use cache::{CacheStats, DocumentCache};
pub use config::StoreConfig;
pub use db::Database;
pub use document::{Document, DocumentKey, FieldPath, ID_FIELD};
pub use error::{BackendError, BackendResult, StoreError, StoreResult};
pub use ops::{NativeUpdate, TrimPolicy, UpdateOperation};
pub use schema::{CollectionSchema, SETTINGS, USERS};
pub use service::{DocumentService, DocumentServiceBuilder};
