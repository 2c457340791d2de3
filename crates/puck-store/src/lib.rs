//! Durable metadata store: one SQLite database holding the puck and
//! snapshot tables. All access goes through a single background connection
//! (one writer), with WAL journaling and enforced foreign keys.

use std::path::Path;

use puck_common::{Error, Result};
use tokio_rusqlite::Connection;
use tracing::debug;

mod pucks;
mod snapshots;

pub struct Store {
    conn: Connection,
}

/// Startup migrations. Each statement is applied in order; errors from the
/// classes below are expected when re-opening an existing database (or one
/// produced by an earlier build) and are skipped, which makes the whole
/// sequence idempotent.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pucks (
        id TEXT PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        image TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'stopped',
        volume_dir TEXT NOT NULL,
        ports TEXT DEFAULT '[]',
        host_port INTEGER DEFAULT 0,
        container_ip TEXT DEFAULT '',
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    // Upgrade stores from builds that predate routing ports / IP tracking.
    "ALTER TABLE pucks ADD COLUMN host_port INTEGER DEFAULT 0",
    "ALTER TABLE pucks ADD COLUMN container_ip TEXT DEFAULT ''",
    // ON UPDATE CASCADE carries snapshot rows across the restore-time
    // rewrite of pucks.id.
    "CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        puck_id TEXT NOT NULL,
        puck_name TEXT NOT NULL,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        size_bytes INTEGER DEFAULT 0,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (puck_id) REFERENCES pucks(id)
            ON DELETE CASCADE ON UPDATE CASCADE,
        UNIQUE(puck_id, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_pucks_name ON pucks(name)",
    "CREATE INDEX IF NOT EXISTS idx_pucks_status ON pucks(status)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_puck ON snapshots(puck_id)",
];

fn is_ignorable_migration_error(err: &rusqlite::Error) -> bool {
    let msg = err.to_string();
    msg.contains("duplicate column")
        || msg.contains("already exists")
        || msg.contains("no such table")
        || msg.contains("no such column")
}

/// Map driver errors onto the failure taxonomy. Unique-constraint hits
/// surface as AlreadyExists so callers see duplicate names for what they
/// are.
pub(crate) fn store_err(err: tokio_rusqlite::Error) -> Error {
    match err {
        tokio_rusqlite::Error::Rusqlite(e) => match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists(e.to_string())
            }
            _ => Error::Internal(format!("database: {e}")),
        },
        other => Error::Unavailable(format!("store: {other}")),
    }
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring its
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Store> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Fatal(format!("creating database directory: {e}")))?;
        }

        let conn = Connection::open(path.to_path_buf())
            .await
            .map_err(|e| Error::Fatal(format!("opening database: {e}")))?;
        let store = Store { conn };
        store.init().await?;
        Ok(store)
    }

    /// An ephemeral in-memory store, for tests.
    pub async fn open_in_memory() -> Result<Store> {
        let conn = Connection::open(":memory:")
            .await
            .map_err(|e| Error::Fatal(format!("opening database: {e}")))?;
        let store = Store { conn };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.pragma_update(None, "busy_timeout", 5000)?;

                for migration in MIGRATIONS {
                    if let Err(e) = conn.execute_batch(migration) {
                        if !is_ignorable_migration_error(&e) {
                            return Err(e.into());
                        }
                    }
                }
                Ok(())
            })
            .await
            .map_err(|e| Error::Fatal(format!("running migrations: {e}")))?;
        debug!("store migrations applied");
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| Error::Internal(format!("closing database: {e}")))
    }
}
