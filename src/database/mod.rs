//! State persistence
//!
//! SQLite-backed store for containers, attachments and exec records. All
//! access goes through the typed stores; multi-step mutations run inside a
//! single rusqlite transaction.

mod attachments;
mod containers;
mod execs;

pub use attachments::{AttachmentRecord, AttachmentStore};
pub use containers::{ContainerRecord, ContainerStatus, ContainerStore};
pub use execs::{ExecCommand, ExecRecord, ExecStore, ExecUsage};

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::Result;

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
    pub containers: ContainerStore,
    pub attachments: AttachmentStore,
    pub execs: ExecStore,
}

impl Database {
    /// Open or create the database, applying pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| crate::error::DaemonError::Internal(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrate(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            containers: ContainerStore::new(),
            attachments: AttachmentStore::new(),
            execs: ExecStore::new(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            containers: ContainerStore::new(),
            attachments: AttachmentStore::new(),
            execs: ExecStore::new(),
        })
    }

    /// Acquire the connection. Callers must not hold the guard across a
    /// Docker call.
    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Compact the store.
    pub async fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Flush the WAL back into the main file.
    pub async fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

/// Apply schema migrations by `user_version`. Each step is committed
/// separately so a partially migrated database resumes where it left off.
fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                docker_id TEXT NOT NULL UNIQUE,
                alias TEXT UNIQUE,
                image TEXT NOT NULL,
                digest TEXT,
                persistent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                ttl_s INTEGER,
                volume_name TEXT,
                status TEXT NOT NULL DEFAULT 'stopped'
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id TEXT NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
                client_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                attached_at TEXT NOT NULL,
                detached_at TEXT
            );

            CREATE TABLE IF NOT EXISTS execs (
                exec_id TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                command TEXT NOT NULL,
                as_root INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                exit_code INTEGER,
                usage TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_attachments_container
                ON attachments(container_id, detached_at);

            CREATE INDEX IF NOT EXISTS idx_execs_container
                ON execs(container_id, ended_at);

            PRAGMA user_version = 1;
            "#,
        )?;
        info!("Applied migration 1 (baseline schema)");
    }

    if version < 2 {
        conn.execute_batch(
            r#"
            ALTER TABLE containers ADD COLUMN idempotency_key TEXT;
            ALTER TABLE containers ADD COLUMN idempotency_key_created_at TEXT;

            CREATE UNIQUE INDEX IF NOT EXISTS ix_containers_idempotency_key
                ON containers(idempotency_key);

            PRAGMA user_version = 2;
            "#,
        )?;
        info!("Applied migration 2 (spawn idempotency keys)");
    }

    Ok(())
}

/// True when the error is a UNIQUE violation on the named column.
pub fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, Some(message)) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation && message.contains(column)
        }
        _ => false,
    }
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_idempotency_key_unique_index() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        let insert = |id: &str, docker_id: &str| {
            conn.execute(
                r#"
                INSERT INTO containers
                    (id, docker_id, image, persistent, created_at, last_seen, status, idempotency_key)
                VALUES (?1, ?2, 'alpine', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 'stopped', 'K')
                "#,
                rusqlite::params![id, docker_id],
            )
        };

        insert("c_1", "d_1").unwrap();
        let err = insert("c_2", "d_2").unwrap_err();
        assert!(is_unique_violation(&err, "idempotency_key"));
    }

    #[test]
    fn test_alias_unique() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        let insert = |id: &str, docker_id: &str| {
            conn.execute(
                r#"
                INSERT INTO containers
                    (id, docker_id, alias, image, persistent, created_at, last_seen, status)
                VALUES (?1, ?2, 'dev', 'alpine', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 'stopped')
                "#,
                rusqlite::params![id, docker_id],
            )
        };

        insert("c_1", "d_1").unwrap();
        let err = insert("c_2", "d_2").unwrap_err();
        assert!(is_unique_violation(&err, "alias"));
    }
}
