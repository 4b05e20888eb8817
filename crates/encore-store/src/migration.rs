//! Versioned schema for the SQLite backend.
//!
//! Each [`Migration`] is applied at most once, inside its own transaction,
//! and recorded in the `_migrations` ledger table.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{BackendError, BackendResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Ordered by version; append only.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "documents table keyed by (collection, id)",
    sql: "CREATE TABLE documents (
              collection TEXT    NOT NULL,
              id         TEXT    NOT NULL,
              body       TEXT    NOT NULL,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (collection, id)
          );",
}];

const LEDGER: &str = "CREATE TABLE IF NOT EXISTS _migrations (
                          version     INTEGER PRIMARY KEY,
                          description TEXT    NOT NULL,
                          applied_at  INTEGER NOT NULL
                      );";

/// Bring `conn` up to the latest schema version.
///
/// Blocking; [`Database`](crate::db::Database) runs it on the blocking pool.
pub fn run_all(conn: &Connection) -> BackendResult<()> {
    conn.execute_batch(LEDGER).map_err(failed(0, "create ledger"))?;

    let current = current_version(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = current, "document schema up to date");
    } else {
        info!(from = current, applied, "document schema migrated");
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
pub fn current_version(conn: &Connection) -> BackendResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(failed(0, "read version"))
}

fn apply(conn: &Connection, migration: &Migration) -> BackendResult<()> {
    let v = migration.version;
    info!(version = v, description = migration.description, "applying migration");

    // Dropping the transaction on any early return rolls it back.
    let tx = conn.unchecked_transaction().map_err(failed(v, "begin"))?;
    tx.execute_batch(migration.sql).map_err(failed(v, "execute"))?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![v, migration.description, chrono::Utc::now().timestamp()],
    )
    .map_err(failed(v, "record"))?;
    tx.commit().map_err(failed(v, "commit"))
}

fn failed(version: u32, step: &'static str) -> impl Fn(rusqlite::Error) -> BackendError {
    move |e| BackendError::Migration {
        version,
        message: format!("{step} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_strictly_increase() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
    }

    #[test]
    fn rerunning_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let latest = MIGRATIONS.last().map_or(0, |m| m.version);
        assert_eq!(current_version(&conn).unwrap(), latest);
        let recorded: i64 = conn
            .query_row("SELECT count(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(recorded, MIGRATIONS.len() as i64);
    }

    #[test]
    fn failed_step_names_version() {
        let err = failed(3, "execute")(rusqlite::Error::InvalidQuery);
        assert!(matches!(err, BackendError::Migration { version: 3, .. }));
        assert!(err.to_string().contains("execute failed"));
    }
}
