//! Local pending log: per-entity record of mutations the server has not
//! confirmed yet.
//!
//! Entries are append-only. Updates to the same entity add rows instead of
//! overwriting; only cleanup and the error sweep delete them.

use rusqlite::{params, Connection, Row as SqlRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use folio_common::{Error, ItemError, OperationKind, Result};

use crate::store::{store_err, LocalStore};

const SELECT_COLUMNS: &str =
    "local_id, table_name, entity_id, operation, status, timestamp, error, data, intent_id";

/// Progress of a local change as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Syncing => "syncing",
            PendingStatus::Synced => "synced",
            PendingStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "syncing" => Ok(PendingStatus::Syncing),
            "synced" => Ok(PendingStatus::Synced),
            "error" => Ok(PendingStatus::Error),
            other => Err(Error::Serialization(format!(
                "Unknown pending status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unconfirmed local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub local_id: i64,
    pub table: String,
    pub entity_id: String,
    pub operation: OperationKind,
    pub status: PendingStatus,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Full row for inserts, partial patch for updates, absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Queue item carrying this change. Absent for local-only changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
}

struct PendingRow {
    local_id: i64,
    table: String,
    entity_id: String,
    operation: String,
    status: String,
    timestamp: i64,
    error: Option<String>,
    data: Option<String>,
    intent_id: Option<String>,
}

impl PendingRow {
    fn from_sql(row: &SqlRow<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            table: row.get(1)?,
            entity_id: row.get(2)?,
            operation: row.get(3)?,
            status: row.get(4)?,
            timestamp: row.get(5)?,
            error: row.get(6)?,
            data: row.get(7)?,
            intent_id: row.get(8)?,
        })
    }

    fn decode(self) -> Result<PendingChange> {
        Ok(PendingChange {
            local_id: self.local_id,
            table: self.table,
            entity_id: self.entity_id,
            operation: OperationKind::parse(&self.operation)?,
            status: PendingStatus::parse(&self.status)?,
            timestamp: self.timestamp,
            error: self.error,
            data: self.data.as_deref().map(serde_json::from_str).transpose()?,
            intent_id: self.intent_id,
        })
    }
}

/// A change about to be recorded.
#[derive(Debug, Clone)]
pub(crate) struct NewChange<'a> {
    pub table: &'a str,
    pub entity_id: &'a str,
    pub operation: OperationKind,
    pub timestamp: i64,
    pub data: Option<&'a Value>,
    pub intent_id: Option<&'a str>,
}

/// Append one entry. Returns its local id.
pub(crate) fn append(conn: &Connection, change: &NewChange<'_>) -> Result<i64> {
    let data = change.data.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO pending_changes \
         (table_name, entity_id, operation, status, timestamp, data, intent_id) \
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
        params![
            change.table,
            change.entity_id,
            change.operation.as_str(),
            change.timestamp,
            data,
            change.intent_id,
        ],
    )
    .map_err(store_err)?;
    Ok(conn.last_insert_rowid())
}

/// Link a local-only entry to a freshly enqueued intent.
pub(crate) fn attach_intent(conn: &Connection, local_id: i64, intent_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE pending_changes SET intent_id = ?1, status = 'pending', error = NULL \
         WHERE local_id = ?2",
        params![intent_id, local_id],
    )
    .map_err(store_err)?;
    Ok(())
}

fn query_changes(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PendingChange>> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params, PendingRow::from_sql)
        .map_err(store_err)?;

    let mut changes = Vec::new();
    for row in rows {
        changes.push(row.map_err(store_err)?.decode()?);
    }
    Ok(changes)
}

/// Handle on the pending log.
pub struct PendingLog {
    store: Arc<LocalStore>,
}

impl PendingLog {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Entries of one table in insertion order.
    pub async fn list(&self, table: &str) -> Result<Vec<PendingChange>> {
        let sql = format!(
            "SELECT {} FROM pending_changes WHERE table_name = ?1 ORDER BY local_id ASC",
            SELECT_COLUMNS
        );
        self.store
            .read(|conn| query_changes(conn, &sql, params![table]))
            .await
    }

    /// Entries of every table in insertion order.
    pub async fn list_all(&self) -> Result<Vec<PendingChange>> {
        let sql = format!(
            "SELECT {} FROM pending_changes ORDER BY local_id ASC",
            SELECT_COLUMNS
        );
        self.store.read(|conn| query_changes(conn, &sql, [])).await
    }

    /// Entries of one table that never reached the queue.
    pub async fn unqueued(&self, table: &str) -> Result<Vec<PendingChange>> {
        let sql = format!(
            "SELECT {} FROM pending_changes WHERE table_name = ?1 AND intent_id IS NULL \
             ORDER BY local_id ASC",
            SELECT_COLUMNS
        );
        self.store
            .read(|conn| query_changes(conn, &sql, params![table]))
            .await
    }

    /// Number of entries per status.
    pub async fn counts(&self) -> Result<HashMap<PendingStatus, usize>> {
        self.store
            .read(|conn| {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM pending_changes GROUP BY status")
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(store_err)?;

                let mut counts = HashMap::new();
                for row in rows {
                    let (status, count) = row.map_err(store_err)?;
                    counts.insert(PendingStatus::parse(&status)?, count as usize);
                }
                Ok(counts)
            })
            .await
    }

    /// Move the entries carried by these intents to `status`.
    pub async fn set_status_for_intents(
        &self,
        intent_ids: &[String],
        status: PendingStatus,
    ) -> Result<()> {
        if intent_ids.is_empty() {
            return Ok(());
        }
        self.store
            .transaction(|tx| {
                for id in intent_ids {
                    tx.execute(
                        "UPDATE pending_changes SET status = ?1, error = NULL WHERE intent_id = ?2",
                        params![status.as_str(), id],
                    )
                    .map_err(store_err)?;
                }
                Ok(())
            })
            .await
    }

    /// Record per-intent failures on the entries they carry.
    pub async fn set_errors_for_intents(&self, errors: &[ItemError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        self.store
            .transaction(|tx| {
                for item in errors {
                    tx.execute(
                        "UPDATE pending_changes SET status = 'error', error = ?1 \
                         WHERE intent_id = ?2",
                        params![item.error, item.id],
                    )
                    .map_err(store_err)?;
                }
                Ok(())
            })
            .await
    }

    /// Delete entries by local id. Returns the number removed.
    pub async fn delete(&self, local_ids: &[i64]) -> Result<usize> {
        if local_ids.is_empty() {
            return Ok(0);
        }
        let removed = self
            .store
            .transaction(|tx| {
                let mut removed = 0;
                for id in local_ids {
                    removed += tx
                        .execute("DELETE FROM pending_changes WHERE local_id = ?1", params![id])
                        .map_err(store_err)?;
                }
                Ok(removed)
            })
            .await?;
        debug!("Deleted {} pending entries", removed);
        Ok(removed)
    }

    /// Drop failed entries recorded before `cutoff_ms`.
    pub async fn prune_errors(&self, cutoff_ms: i64) -> Result<usize> {
        let removed = self
            .store
            .transaction(|tx| {
                tx.execute(
                    "DELETE FROM pending_changes WHERE status = 'error' AND timestamp < ?1",
                    params![cutoff_ms],
                )
                .map_err(store_err)
            })
            .await?;
        if removed > 0 {
            info!("Pruned {} expired failed entries", removed);
        }
        Ok(removed)
    }
}
