//! Shared SQLite connection for the persistent backend.
//!
//! One [`Database`] holds a single connection; every [`SqliteStore`]
//! (one per collection) clones the handle. Work runs on tokio's blocking
//! pool so document I/O never stalls the runtime.
//!
//! [`SqliteStore`]: crate::backend::SqliteStore

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{BackendError, BackendResult};
use crate::migration;

/// Connection-level settings applied on open.
const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("temp_store", "MEMORY"),
];

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable handle to the document database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// Blocks on file I/O; async callers want [`open_and_migrate`](Self::open_and_migrate).
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening document database");
        Self::configure(Connection::open(path)?)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> BackendResult<Self> {
        debug!("opening in-memory document database");
        Self::configure(Connection::open_in_memory()?)
    }

    /// Open `path` on the blocking pool and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> BackendResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> BackendResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run `f` with shared access to the connection.
    pub async fn execute<F, T>(&self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&Connection) -> BackendResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_mut(move |conn| f(conn)).await
    }

    /// Run `f` with exclusive access, e.g. to open a transaction.
    pub async fn execute_mut<F, T>(&self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut Connection) -> BackendResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await?
    }

    fn configure(conn: Connection) -> BackendResult<Self> {
        for (name, value) in PRAGMAS {
            conn.pragma_update(None, name, value)?;
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!(pragmas = PRAGMAS.len(), "connection configured");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> BackendResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| BackendError::Unavailable("database connection poisoned".into()))
}
