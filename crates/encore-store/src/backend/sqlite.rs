//! SQLite-backed [`DocumentStore`].
//!
//! Each document is one row of the `documents` table, keyed by collection
//! name and the JSON encoding of its [`DocumentKey`] (so the integer key
//! `42` and the string key `"42"` stay distinct). Updates decode the native
//! expression and apply it inside a transaction.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{ErrorCode, OptionalExtension};
use tracing::{debug, instrument};

use super::{DocumentStore, UpdateResult, apply_native};
use crate::db::Database;
use crate::document::{Document, DocumentKey};
use crate::error::{BackendError, BackendResult};
use crate::ops::NativeUpdate;

/// One collection stored in a SQLite [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    collection: String,
}

impl SqliteStore {
    /// A store for `collection` inside `db` (migrations must have run).
    pub fn new(db: Database, collection: impl Into<String>) -> Self {
        Self {
            db,
            collection: collection.into(),
        }
    }
}

fn encode_key(key: &DocumentKey) -> BackendResult<String> {
    Ok(serde_json::to_string(key)?)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl DocumentStore for SqliteStore {
    #[instrument(skip(self), fields(collection = %self.collection))]
    async fn find_one(&self, key: &DocumentKey) -> BackendResult<Option<Document>> {
        let collection = self.collection.clone();
        let id = encode_key(key)?;
        let body: Option<String> = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                        rusqlite::params![collection, id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(BackendError::from))
            .transpose()
    }

    #[instrument(skip(self, doc), fields(collection = %self.collection))]
    async fn insert_one(&self, doc: &Document) -> BackendResult<()> {
        let key = DocumentKey::from_document(doc)
            .ok_or_else(|| BackendError::Rejected("document has no usable `_id`".into()))?;
        let collection = self.collection.clone();
        let id = encode_key(&key)?;
        let body = serde_json::to_string(doc)?;
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO documents (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![collection, id, body, now],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        BackendError::Duplicate { id: key.to_string() }
                    } else {
                        BackendError::Sqlite(e)
                    }
                })?;
                Ok(())
            })
            .await?;

        debug!("document inserted");
        Ok(())
    }

    #[instrument(skip(self, update), fields(collection = %self.collection))]
    async fn update_one(
        &self,
        key: &DocumentKey,
        update: &NativeUpdate,
    ) -> BackendResult<UpdateResult> {
        let collection = self.collection.clone();
        let id = encode_key(key)?;
        let update = update.clone();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let body: Option<String> = tx
                    .query_row(
                        "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                        rusqlite::params![collection, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(body) = body else {
                    return Ok(UpdateResult {
                        matched: false,
                        modified: false,
                    });
                };

                let current: Document = serde_json::from_str(&body)?;
                let (updated, modified) = apply_native(&current, &update)?;
                if modified {
                    tx.execute(
                        "UPDATE documents SET body = ?1, updated_at = ?2 \
                         WHERE collection = ?3 AND id = ?4",
                        rusqlite::params![
                            serde_json::to_string(&updated)?,
                            Utc::now().timestamp(),
                            collection,
                            id
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(UpdateResult {
                    matched: true,
                    modified,
                })
            })
            .await
    }

    #[instrument(skip(self), fields(collection = %self.collection))]
    async fn delete_one(&self, key: &DocumentKey) -> BackendResult<bool> {
        let collection = self.collection.clone();
        let id = encode_key(key)?;
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                    rusqlite::params![collection, id],
                )?)
            })
            .await?;
        Ok(removed > 0)
    }
}
