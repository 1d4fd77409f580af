//! Pending-log cleanup.
//!
//! When a table receives fresh remote data, entries the mirror now confirms
//! are deleted from the pending log. A separate sweep drops failed entries
//! once they outlive the error TTL.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use folio_common::{Clock, OperationKind, Result, Row};

use crate::config::CleanupConfig;
use crate::feed::FeedEvent;
use crate::mirror::SyncedMirror;
use crate::pending::{PendingChange, PendingLog};

/// Prunes confirmed and expired pending entries.
pub struct Cleanup {
    pending: Arc<PendingLog>,
    mirror: Arc<SyncedMirror>,
    clock: Arc<dyn Clock>,
    config: CleanupConfig,
    passes: AtomicU64,
}

impl Cleanup {
    pub fn new(
        pending: Arc<PendingLog>,
        mirror: Arc<SyncedMirror>,
        clock: Arc<dyn Clock>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            pending,
            mirror,
            clock,
            config,
            passes: AtomicU64::new(0),
        }
    }

    /// Delete the table's entries that the mirror confirms. Returns how many
    /// were removed. Tables never mirrored are left alone.
    pub async fn reconcile_table(&self, table: &str) -> Result<usize> {
        if self.mirror.synced_at(table).await?.is_none() {
            return Ok(0);
        }
        let synced = self.mirror.rows_by_id(table).await?;
        let entries = self.pending.list(table).await?;

        let confirmed = self.confirmed(&entries, &synced);
        if confirmed.is_empty() {
            return Ok(0);
        }
        let removed = self.pending.delete(&confirmed).await?;
        debug!("Pruned {} confirmed entries of {}", removed, table);
        Ok(removed)
    }

    fn confirmed(&self, entries: &[PendingChange], synced: &HashMap<String, Row>) -> Vec<i64> {
        let mut confirmed: HashSet<i64> = HashSet::new();

        for entry in entries {
            let row = synced.get(&entry.entity_id);
            match entry.operation {
                OperationKind::Insert | OperationKind::Update => {
                    if row.is_some_and(|row| self.is_current(row, entry.timestamp)) {
                        confirmed.insert(entry.local_id);
                    }
                }
                OperationKind::Delete => {
                    if row.is_none() {
                        // a confirmed delete retires everything before it
                        confirmed.extend(
                            entries
                                .iter()
                                .filter(|e| {
                                    e.entity_id == entry.entity_id && e.local_id <= entry.local_id
                                })
                                .map(|e| e.local_id),
                        );
                    }
                }
            }
        }

        let mut confirmed: Vec<i64> = confirmed.into_iter().collect();
        confirmed.sort_unstable();
        confirmed
    }

    /// Whether the synced row already incorporates a change made at
    /// `timestamp`. Rows without the timestamp field count on presence.
    fn is_current(&self, row: &Row, timestamp: i64) -> bool {
        if !self.config.compare_update_timestamps {
            return true;
        }
        match row.get(&self.config.updated_at_field).and_then(|v| v.as_i64()) {
            Some(synced_at) => synced_at >= timestamp,
            None => true,
        }
    }

    /// Drop failed entries older than the error TTL.
    pub async fn prune_expired_errors(&self) -> Result<usize> {
        let cutoff = self.clock.now_ms() - self.config.error_ttl.as_millis() as i64;
        self.pending.prune_errors(cutoff).await
    }

    /// Debounced passes run so far by [`Cleanup::spawn`].
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Reconcile tables as fresh-data events arrive, coalescing bursts
    /// within the debounce window. Missed events widen the pass to every
    /// mirrored table.
    pub fn spawn(self: Arc<Self>, mut events: broadcast::Receiver<FeedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mut tables = HashSet::new();
                let mut lagged = false;
                match events.recv().await {
                    Ok(FeedEvent::Fresh { table }) => {
                        tables.insert(table);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Cleanup lagged behind {} feed events", skipped);
                        lagged = true;
                    }
                    Err(RecvError::Closed) => break,
                }

                let debounce = sleep(self.config.debounce);
                tokio::pin!(debounce);
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(FeedEvent::Fresh { table }) => {
                                tables.insert(table);
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("Cleanup lagged behind {} feed events", skipped);
                                lagged = true;
                            }
                            Err(RecvError::Closed) => break,
                        },
                        _ = &mut debounce => break,
                    }
                }

                if lagged {
                    match self.mirror.tables().await {
                        Ok(all) => tables.extend(all),
                        Err(e) => warn!("Failed to list mirrored tables: {}", e),
                    }
                }
                self.run_pass(tables).await;
            }
            debug!("Cleanup task stopped");
        })
    }

    async fn run_pass(&self, tables: HashSet<String>) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        for table in tables {
            if let Err(e) = self.reconcile_table(&table).await {
                warn!("Cleanup of {} failed: {}", table, e);
            }
        }
    }

    /// Run the error sweep now and then every sweep interval.
    pub fn spawn_error_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.error_sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.prune_expired_errors().await {
                    Ok(0) => {}
                    Ok(n) => info!("Error sweep removed {} entries", n),
                    Err(e) => warn!("Error sweep failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{append, NewChange, PendingStatus};
    use crate::store::LocalStore;
    use folio_common::{ItemError, ManualClock};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Fixture {
        store: Arc<LocalStore>,
        pending: Arc<PendingLog>,
        mirror: Arc<SyncedMirror>,
        clock: Arc<ManualClock>,
        cleanup: Arc<Cleanup>,
    }

    fn fixture(config: CleanupConfig) -> Fixture {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let pending = Arc::new(PendingLog::new(store.clone()));
        let mirror = Arc::new(SyncedMirror::new(store.clone(), clock.clone()));
        let cleanup = Arc::new(Cleanup::new(
            pending.clone(),
            mirror.clone(),
            clock.clone(),
            config,
        ));
        Fixture {
            store,
            pending,
            mirror,
            clock,
            cleanup,
        }
    }

    async fn record(fx: &Fixture, id: &str, op: OperationKind, ts: i64, intent: &str) {
        let data = (op != OperationKind::Delete).then(|| json!({"id": id}));
        fx.store
            .transaction(|tx| {
                append(
                    tx,
                    &NewChange {
                        table: "works",
                        entity_id: id,
                        operation: op,
                        timestamp: ts,
                        data: data.as_ref(),
                        intent_id: Some(intent),
                    },
                )
            })
            .await
            .unwrap();
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn remaining(fx: &Fixture) -> Vec<(String, i64)> {
        fx.pending
            .list("works")
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.entity_id, e.timestamp))
            .collect()
    }

    #[tokio::test]
    async fn test_unmirrored_table_is_untouched() {
        let fx = fixture(CleanupConfig::default());
        record(&fx, "gone", OperationKind::Delete, 1, "i1").await;
        assert_eq!(fx.cleanup.reconcile_table("works").await.unwrap(), 0);
        assert_eq!(remaining(&fx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_updates_wait_for_newer_server_row() {
        let fx = fixture(CleanupConfig::default());
        record(&fx, "e", OperationKind::Insert, 10, "i1").await;
        record(&fx, "e", OperationKind::Update, 20, "i2").await;
        record(&fx, "e", OperationKind::Update, 30, "i3").await;

        fx.mirror
            .replace("works", &[row(json!({"id": "e", "updatedAt": 20}))])
            .await
            .unwrap();
        assert_eq!(fx.cleanup.reconcile_table("works").await.unwrap(), 2);
        assert_eq!(remaining(&fx).await, vec![("e".to_string(), 30)]);

        fx.mirror
            .replace("works", &[row(json!({"id": "e", "updatedAt": 30}))])
            .await
            .unwrap();
        assert_eq!(fx.cleanup.reconcile_table("works").await.unwrap(), 1);
        assert!(remaining(&fx).await.is_empty());
    }

    #[tokio::test]
    async fn test_presence_suffices_without_timestamps() {
        let fx = fixture(CleanupConfig {
            compare_update_timestamps: false,
            ..CleanupConfig::default()
        });
        record(&fx, "e", OperationKind::Update, 50, "i1").await;
        fx.mirror
            .replace("works", &[row(json!({"id": "e", "updatedAt": 1}))])
            .await
            .unwrap();
        assert_eq!(fx.cleanup.reconcile_table("works").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_confirmed_by_absence() {
        let fx = fixture(CleanupConfig::default());
        record(&fx, "kept", OperationKind::Delete, 1, "i1").await;
        record(&fx, "local", OperationKind::Insert, 1, "i2").await;
        record(&fx, "local", OperationKind::Delete, 2, "i3").await;

        fx.mirror
            .replace("works", &[row(json!({"id": "kept"}))])
            .await
            .unwrap();
        assert_eq!(fx.cleanup.reconcile_table("works").await.unwrap(), 2);
        assert_eq!(remaining(&fx).await, vec![("kept".to_string(), 1)]);

        fx.mirror.replace("works", &[]).await.unwrap();
        assert_eq!(fx.cleanup.reconcile_table("works").await.unwrap(), 1);
        assert!(remaining(&fx).await.is_empty());
    }

    #[tokio::test]
    async fn test_error_sweep_uses_ttl() {
        let fx = fixture(CleanupConfig {
            error_ttl: Duration::from_millis(500),
            ..CleanupConfig::default()
        });
        record(&fx, "old", OperationKind::Insert, 1_000, "i1").await;
        fx.pending
            .set_errors_for_intents(&[ItemError {
                id: "i1".to_string(),
                error: "rejected".to_string(),
            }])
            .await
            .unwrap();

        assert_eq!(fx.cleanup.prune_expired_errors().await.unwrap(), 0);
        fx.clock.advance(501);
        assert_eq!(fx.cleanup.prune_expired_errors().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fresh_events_trigger_debounced_cleanup() {
        let fx = fixture(CleanupConfig {
            debounce: Duration::from_millis(20),
            ..CleanupConfig::default()
        });
        record(&fx, "e", OperationKind::Insert, 10, "i1").await;
        fx.mirror
            .replace("works", &[row(json!({"id": "e", "updatedAt": 10}))])
            .await
            .unwrap();

        let (tx, rx) = broadcast::channel(8);
        let task = fx.cleanup.clone().spawn(rx);
        for _ in 0..3 {
            tx.send(FeedEvent::Fresh {
                table: "works".to_string(),
            })
            .unwrap();
        }

        for _ in 0..50 {
            if remaining(&fx).await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(remaining(&fx).await.is_empty());

        drop(tx);
        task.await.unwrap();
        assert!(fx.pending.counts().await.unwrap().get(&PendingStatus::Pending).is_none());
        // the burst collapsed into a single pass
        assert_eq!(fx.cleanup.passes(), 1);
    }

    #[tokio::test]
    async fn test_lagged_events_reconcile_every_mirrored_table() {
        let fx = fixture(CleanupConfig {
            debounce: Duration::from_millis(20),
            ..CleanupConfig::default()
        });
        record(&fx, "e", OperationKind::Insert, 10, "i1").await;
        fx.mirror
            .replace("works", &[row(json!({"id": "e", "updatedAt": 10}))])
            .await
            .unwrap();

        // capacity 1: the event for "works" is overwritten before cleanup reads it
        let (tx, rx) = broadcast::channel(1);
        tx.send(FeedEvent::Fresh {
            table: "works".to_string(),
        })
        .unwrap();
        tx.send(FeedEvent::Fresh {
            table: "cards".to_string(),
        })
        .unwrap();

        let task = fx.cleanup.clone().spawn(rx);
        for _ in 0..50 {
            if fx.cleanup.passes() > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(fx.cleanup.passes(), 1);
        assert!(remaining(&fx).await.is_empty());
    }
}
