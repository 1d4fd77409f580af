//! SQLite-backed local store shared by the queue, the pending log and the
//! synced mirror.
//!
//! One connection, guarded by an async mutex. Every logical operation runs
//! inside a single transaction so readers never observe half of it.

use rusqlite::{Connection, Transaction};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;

use folio_common::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        table_name TEXT NOT NULL,
        operation TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        applied_at INTEGER,
        server_response TEXT,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        next_attempt_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, created_at);

    CREATE TABLE IF NOT EXISTS pending_changes (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        status TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        error TEXT,
        data TEXT,
        intent_id TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_pending_entity ON pending_changes(table_name, entity_id);
    CREATE INDEX IF NOT EXISTS idx_pending_intent ON pending_changes(intent_id);

    CREATE TABLE IF NOT EXISTS synced_rows (
        table_name TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (table_name, id)
    );

    CREATE TABLE IF NOT EXISTS mirror_meta (
        table_name TEXT PRIMARY KEY,
        synced_at INTEGER NOT NULL
    );
"#;

/// Map a SQLite error into the engine error.
pub(crate) fn store_err(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}

/// Local embedded store.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(store_err)?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        info!("Local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one transaction, committing on success.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(store_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(store_err)?;
        Ok(value)
    }

    /// Run a read against the connection.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}
