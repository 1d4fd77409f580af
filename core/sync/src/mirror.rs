//! Local mirror of server-authoritative rows.

use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use folio_common::{row_id, Clock, Result, Row};

use crate::store::{store_err, LocalStore};

/// Synced rows per table, replaced wholesale on every full-table snapshot.
pub struct SyncedMirror {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
}

impl SyncedMirror {
    pub fn new(store: Arc<LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Replace a table's rows in one transaction. Rows without a string id
    /// are skipped.
    pub async fn replace(&self, table: &str, rows: &[Row]) -> Result<usize> {
        let now = self.clock.now_ms();
        let written = self
            .store
            .transaction(|tx| {
                tx.execute("DELETE FROM synced_rows WHERE table_name = ?1", params![table])
                    .map_err(store_err)?;

                let mut written = 0;
                for row in rows {
                    let Some(id) = row_id(row) else {
                        continue;
                    };
                    let data = serde_json::to_string(row)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO synced_rows (table_name, id, data) \
                         VALUES (?1, ?2, ?3)",
                        params![table, id, data],
                    )
                    .map_err(store_err)?;
                    written += 1;
                }

                tx.execute(
                    "INSERT OR REPLACE INTO mirror_meta (table_name, synced_at) VALUES (?1, ?2)",
                    params![table, now],
                )
                .map_err(store_err)?;
                Ok(written)
            })
            .await?;
        debug!("Mirrored {} rows of {}", written, table);
        Ok(written)
    }

    /// Current rows of a table.
    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.store
            .read(|conn| {
                let mut stmt = conn
                    .prepare("SELECT data FROM synced_rows WHERE table_name = ?1 ORDER BY id")
                    .map_err(store_err)?;
                let raw = stmt
                    .query_map(params![table], |row| row.get::<_, String>(0))
                    .map_err(store_err)?;

                let mut rows = Vec::new();
                for data in raw {
                    rows.push(serde_json::from_str(&data.map_err(store_err)?)?);
                }
                Ok(rows)
            })
            .await
    }

    /// Rows of a table keyed by id.
    pub async fn rows_by_id(&self, table: &str) -> Result<HashMap<String, Row>> {
        let rows = self.rows(table).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| Some((row_id(&row)?.to_string(), row)))
            .collect())
    }

    /// When the table was last replaced, if ever.
    pub async fn synced_at(&self, table: &str) -> Result<Option<i64>> {
        self.store
            .read(|conn| {
                conn.query_row(
                    "SELECT synced_at FROM mirror_meta WHERE table_name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)
            })
            .await
    }

    /// Tables replaced at least once.
    pub async fn tables(&self) -> Result<Vec<String>> {
        self.store
            .read(|conn| {
                let mut stmt = conn
                    .prepare("SELECT table_name FROM mirror_meta ORDER BY table_name")
                    .map_err(store_err)?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(store_err)?;
                names
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(store_err)
            })
            .await
    }

    /// Drop a table's rows, e.g. after the remote truncated it.
    pub async fn clear(&self, table: &str) -> Result<()> {
        self.store
            .transaction(|tx| {
                tx.execute("DELETE FROM synced_rows WHERE table_name = ?1", params![table])
                    .map_err(store_err)?;
                tx.execute("DELETE FROM mirror_meta WHERE table_name = ?1", params![table])
                    .map_err(store_err)?;
                Ok(())
            })
            .await
    }
}
