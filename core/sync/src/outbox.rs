//! Outbound queue: durable buffer of mutations waiting for the remote.

use rusqlite::{params, Connection, OptionalExtension, Row as SqlRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use folio_common::{
    Clock, IntentStatus, ItemError, MutationIntent, OperationKind, Result,
};

use crate::backoff::Backoff;
use crate::store::{store_err, LocalStore};

const SELECT_COLUMNS: &str = "id, table_name, operation, payload, created_at, status, \
     applied_at, server_response, error, retry_count, last_attempt_at, next_attempt_at";

/// Raw outbox row before JSON columns are decoded.
struct IntentRow {
    id: String,
    table: String,
    operation: String,
    payload: String,
    created_at: i64,
    status: String,
    applied_at: Option<i64>,
    server_response: Option<String>,
    error: Option<String>,
    retry_count: u32,
    last_attempt_at: Option<i64>,
    next_attempt_at: Option<i64>,
}

impl IntentRow {
    fn from_sql(row: &SqlRow<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table: row.get(1)?,
            operation: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
            status: row.get(5)?,
            applied_at: row.get(6)?,
            server_response: row.get(7)?,
            error: row.get(8)?,
            retry_count: row.get(9)?,
            last_attempt_at: row.get(10)?,
            next_attempt_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<MutationIntent> {
        Ok(MutationIntent {
            id: self.id,
            table: self.table,
            operation: OperationKind::parse(&self.operation)?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: self.created_at,
            status: IntentStatus::parse(&self.status)?,
            applied_at: self.applied_at,
            server_response: self
                .server_response
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: self.error,
            retry_count: self.retry_count,
            last_attempt_at: self.last_attempt_at,
            next_attempt_at: self.next_attempt_at,
        })
    }
}

/// Persist a new intent. Used inside larger transactions by the write API.
pub(crate) fn insert_intent(conn: &Connection, intent: &MutationIntent) -> Result<()> {
    let payload = serde_json::to_string(&intent.payload)?;
    conn.execute(
        "INSERT INTO outbox (id, table_name, operation, payload, created_at, status, retry_count) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            intent.id,
            intent.table,
            intent.operation.as_str(),
            payload,
            intent.created_at,
            intent.status.as_str(),
            intent.retry_count,
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

fn query_intents(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<MutationIntent>> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params, IntentRow::from_sql)
        .map_err(store_err)?;

    let mut intents = Vec::new();
    for row in rows {
        intents.push(row.map_err(store_err)?.decode()?);
    }
    Ok(intents)
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_status: HashMap<IntentStatus, usize>,
    pub by_table: HashMap<String, usize>,
    /// Items whose retry budget is spent.
    pub stuck: Vec<MutationIntent>,
}

impl QueueStats {
    pub fn count(&self, status: IntentStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Durable outbound queue.
pub struct Outbox {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl Outbox {
    pub fn new(store: Arc<LocalStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist a new mutation and return it.
    pub async fn enqueue(
        &self,
        table: &str,
        operation: OperationKind,
        payload: Value,
    ) -> Result<MutationIntent> {
        let intent = MutationIntent::new(table, operation, payload, self.clock.now_ms());
        self.store
            .transaction(|tx| insert_intent(tx, &intent))
            .await?;
        debug!("Enqueued {} {} ({})", intent.operation, intent.table, intent.id);
        Ok(intent)
    }

    /// Oldest retryable items, at most `limit`.
    pub async fn peek(&self, limit: usize) -> Result<Vec<MutationIntent>> {
        let now = self.clock.now_ms();
        let max_retries = self.max_retries;
        let sql = format!(
            "SELECT {} FROM outbox \
             WHERE status IN ('pending', 'error') AND retry_count < ?1 \
             AND (next_attempt_at IS NULL OR next_attempt_at <= ?2) \
             ORDER BY created_at ASC, seq ASC LIMIT ?3",
            SELECT_COLUMNS
        );
        self.store
            .read(|conn| query_intents(conn, &sql, params![max_retries, now, limit as i64]))
            .await
    }

    /// Fetch one item by id.
    pub async fn get(&self, id: &str) -> Result<Option<MutationIntent>> {
        let sql = format!("SELECT {} FROM outbox WHERE id = ?1", SELECT_COLUMNS);
        self.store
            .read(|conn| {
                let row = conn
                    .query_row(&sql, params![id], IntentRow::from_sql)
                    .optional()
                    .map_err(store_err)?;
                row.map(IntentRow::decode).transpose()
            })
            .await
    }

    /// Every item in the queue, oldest first.
    pub async fn all(&self) -> Result<Vec<MutationIntent>> {
        let sql = format!(
            "SELECT {} FROM outbox ORDER BY created_at ASC, seq ASC",
            SELECT_COLUMNS
        );
        self.store.read(|conn| query_intents(conn, &sql, [])).await
    }

    /// Flag items as part of an in-flight batch.
    pub async fn mark_syncing(&self, ids: &[String]) -> Result<()> {
        let now = self.clock.now_ms();
        self.store
            .transaction(|tx| {
                for id in ids {
                    tx.execute(
                        "UPDATE outbox SET status = 'syncing', last_attempt_at = ?1 WHERE id = ?2",
                        params![now, id],
                    )
                    .map_err(store_err)?;
                }
                Ok(())
            })
            .await
    }

    /// Record remote acceptance. `responses`, when present, is index-aligned
    /// with `ids`; the caller drops entries for ids it did not send.
    pub async fn mark_applied(&self, ids: &[String], responses: Option<&[Value]>) -> Result<()> {
        let now = self.clock.now_ms();
        self.store
            .transaction(|tx| {
                for (i, id) in ids.iter().enumerate() {
                    let response = responses
                        .and_then(|r| r.get(i))
                        .map(serde_json::to_string)
                        .transpose()?;
                    tx.execute(
                        "UPDATE outbox SET status = 'applied', applied_at = ?1, \
                         server_response = ?2, error = NULL, next_attempt_at = NULL \
                         WHERE id = ?3",
                        params![now, response, id],
                    )
                    .map_err(store_err)?;
                }
                Ok(())
            })
            .await
    }

    /// Record failures and bump retry counts. With `backoff`, each item is
    /// also held back until its next exponential slot.
    pub async fn mark_failed(
        &self,
        errors: &[ItemError],
        backoff: Option<&Backoff>,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        self.store
            .transaction(|tx| {
                for item in errors {
                    let retry_count: Option<u32> = tx
                        .query_row(
                            "SELECT retry_count FROM outbox WHERE id = ?1",
                            params![item.id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(store_err)?;
                    let Some(retry_count) = retry_count else {
                        continue;
                    };

                    let next_attempt_at =
                        backoff.map(|backoff| backoff.retry_at(now, retry_count));
                    tx.execute(
                        "UPDATE outbox SET status = 'error', retry_count = ?1, error = ?2, \
                         next_attempt_at = ?3 WHERE id = ?4",
                        params![retry_count + 1, item.error, next_attempt_at, item.id],
                    )
                    .map_err(store_err)?;
                }
                Ok(())
            })
            .await
    }

    /// Hard-delete one item. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store
            .transaction(|tx| {
                let n = tx
                    .execute("DELETE FROM outbox WHERE id = ?1", params![id])
                    .map_err(store_err)?;
                Ok(n > 0)
            })
            .await
    }

    /// Items whose retry budget is spent.
    pub async fn stuck(&self) -> Result<Vec<MutationIntent>> {
        let max_retries = self.max_retries;
        let sql = format!(
            "SELECT {} FROM outbox WHERE status = 'error' AND retry_count >= ?1 \
             ORDER BY created_at ASC, seq ASC",
            SELECT_COLUMNS
        );
        self.store
            .read(|conn| query_intents(conn, &sql, params![max_retries]))
            .await
    }

    /// Remove stuck items and return what was removed.
    pub async fn evict_stuck(&self) -> Result<Vec<MutationIntent>> {
        let stuck = self.stuck().await?;
        if stuck.is_empty() {
            return Ok(stuck);
        }
        self.store
            .transaction(|tx| {
                for intent in &stuck {
                    tx.execute("DELETE FROM outbox WHERE id = ?1", params![intent.id])
                        .map_err(store_err)?;
                }
                Ok(())
            })
            .await?;
        Ok(stuck)
    }

    /// Counts by status and table, plus the stuck list.
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let max_retries = self.max_retries;
        let all = self.all().await?;

        let mut stats = QueueStats {
            total: all.len(),
            ..QueueStats::default()
        };
        for intent in all {
            *stats.by_status.entry(intent.status).or_insert(0) += 1;
            *stats.by_table.entry(intent.table.clone()).or_insert(0) += 1;
            if intent.status == IntentStatus::Error && intent.is_stuck(max_retries) {
                stats.stuck.push(intent);
            }
        }
        Ok(stats)
    }

    /// Hard-delete every failed item.
    pub async fn clear_failed(&self) -> Result<usize> {
        let removed = self
            .store
            .transaction(|tx| {
                tx.execute("DELETE FROM outbox WHERE status = 'error'", [])
                    .map_err(store_err)
            })
            .await?;
        if removed > 0 {
            info!("Cleared {} failed queue items", removed);
        }
        Ok(removed)
    }

    /// Hard-delete every applied item.
    pub async fn clear_applied(&self) -> Result<usize> {
        self.store
            .transaction(|tx| {
                tx.execute("DELETE FROM outbox WHERE status = 'applied'", [])
                    .map_err(store_err)
            })
            .await
    }

    /// Return items stranded mid-flight by a crash to the pending state.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let recovered = self
            .store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE outbox SET status = 'pending' WHERE status = 'syncing'",
                    [],
                )
                .map_err(store_err)
            })
            .await?;
        if recovered > 0 {
            info!("Recovered {} interrupted queue items", recovered);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_common::ManualClock;
    use serde_json::json;

    fn outbox_with_clock() -> (Outbox, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(LocalStore::in_memory().unwrap());
        (Outbox::new(store, clock.clone(), 3), clock)
    }

    fn fail(id: &str) -> ItemError {
        ItemError {
            id: id.to_string(),
            error: "HTTP 500".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (outbox, _clock) = outbox_with_clock();
        let intent = outbox
            .enqueue("works", OperationKind::Insert, json!({"id": "w1"}))
            .await
            .unwrap();

        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(intent.retry_count, 0);
        assert_eq!(intent.created_at, 1_000);

        let stored = outbox.get(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored, intent);
    }

    #[tokio::test]
    async fn test_peek_is_fifo_across_tables() {
        let (outbox, clock) = outbox_with_clock();
        let a = outbox.enqueue("works", OperationKind::Insert, json!({"id": "a"})).await.unwrap();
        clock.advance(1);
        let b = outbox.enqueue("cards", OperationKind::Insert, json!({"id": "b"})).await.unwrap();
        // same millisecond as b: insertion order breaks the tie
        let c = outbox.enqueue("works", OperationKind::Delete, json!({"id": "c"})).await.unwrap();

        let ids: Vec<String> = outbox.peek(10).await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id, c.id]);

        let limited = outbox.peek(1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, a.id);
    }

    #[tokio::test]
    async fn test_peek_skips_applied_syncing_and_stuck() {
        let (outbox, _clock) = outbox_with_clock();
        let applied = outbox.enqueue("t", OperationKind::Insert, json!({"id": "1"})).await.unwrap();
        let syncing = outbox.enqueue("t", OperationKind::Insert, json!({"id": "2"})).await.unwrap();
        let failing = outbox.enqueue("t", OperationKind::Insert, json!({"id": "3"})).await.unwrap();

        outbox.mark_applied(&[applied.id.clone()], Some(&[json!({"ok": true})])).await.unwrap();
        outbox.mark_syncing(&[syncing.id.clone()]).await.unwrap();
        outbox.mark_failed(&[fail(&failing.id)], None).await.unwrap();

        let peeked = outbox.peek(10).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].id, failing.id);
        assert_eq!(peeked[0].retry_count, 1);
        assert_eq!(peeked[0].error.as_deref(), Some("HTTP 500"));

        for _ in 0..2 {
            outbox.mark_failed(&[fail(&failing.id)], None).await.unwrap();
        }
        assert!(outbox.peek(10).await.unwrap().is_empty());

        let stored = outbox.get(&applied.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Applied);
        assert_eq!(stored.applied_at, Some(1_000));
        assert_eq!(stored.server_response, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_backoff_holds_items_back() {
        let (outbox, clock) = outbox_with_clock();
        let intent = outbox.enqueue("t", OperationKind::Update, json!({"id": "1"})).await.unwrap();
        let backoff = Backoff::queue(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(60),
        );

        outbox.mark_failed(&[fail(&intent.id)], Some(&backoff)).await.unwrap();
        assert!(outbox.peek(10).await.unwrap().is_empty());

        clock.advance(100);
        assert_eq!(outbox.peek(10).await.unwrap().len(), 1);

        // second failure doubles the delay
        outbox.mark_failed(&[fail(&intent.id)], Some(&backoff)).await.unwrap();
        clock.advance(150);
        assert!(outbox.peek(10).await.unwrap().is_empty());
        clock.advance(50);
        assert_eq!(outbox.peek(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_clear_failed() {
        let (outbox, _clock) = outbox_with_clock();
        let a = outbox.enqueue("works", OperationKind::Insert, json!({"id": "a"})).await.unwrap();
        outbox.enqueue("cards", OperationKind::Insert, json!({"id": "b"})).await.unwrap();

        for _ in 0..3 {
            outbox.mark_failed(&[fail(&a.id)], None).await.unwrap();
        }

        let stats = outbox.get_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(IntentStatus::Error), 1);
        assert_eq!(stats.count(IntentStatus::Pending), 1);
        assert_eq!(stats.by_table["works"], 1);
        assert_eq!(stats.stuck.len(), 1);
        assert_eq!(stats.stuck[0].id, a.id);

        assert_eq!(outbox.clear_failed().await.unwrap(), 1);
        assert_eq!(outbox.get_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_recover_and_remove() {
        let (outbox, _clock) = outbox_with_clock();
        let a = outbox.enqueue("t", OperationKind::Insert, json!({"id": "a"})).await.unwrap();
        outbox.mark_syncing(&[a.id.clone()]).await.unwrap();
        assert!(outbox.peek(10).await.unwrap().is_empty());

        assert_eq!(outbox.recover_interrupted().await.unwrap(), 1);
        assert_eq!(outbox.peek(10).await.unwrap().len(), 1);

        assert!(outbox.remove(&a.id).await.unwrap());
        assert!(!outbox.remove(&a.id).await.unwrap());
        assert!(outbox.get(&a.id).await.unwrap().is_none());
    }
}
