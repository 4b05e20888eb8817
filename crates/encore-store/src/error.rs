//! Error types for the encore-store crate.
//!
//! Cache-level operations return [`StoreError`] via [`StoreResult`].
//! Backends implementing [`DocumentStore`](crate::backend::DocumentStore)
//! report [`BackendError`], which the cache wraps into
//! [`StoreError::StoreUnavailable`] together with the collection and key
//! it was working on.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Alias for `Result<T, BackendError>`.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by the cache, the operator engine and the batch writer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A field path could not be parsed or addresses through a non-mapping.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// An operator met a value of the wrong shape.
    #[error("type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The backing store failed; the cache entry for `key` was evicted.
    #[error("store unavailable for {collection}/{key}: {source}")]
    StoreUnavailable {
        collection: String,
        key: String,
        #[source]
        source: BackendError,
    },

    /// The requested collection or field does not exist in the schema.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors a [`DocumentStore`](crate::backend::DocumentStore) backend may raise.
#[derive(Debug, Error)]
pub enum BackendError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// A document with this id already exists.
    #[error("duplicate document id: {id}")]
    Duplicate { id: String },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused a native update expression.
    #[error("update rejected: {0}")]
    Rejected(String),
}

impl From<tokio::task::JoinError> for BackendError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
