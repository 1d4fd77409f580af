//! Flush driver: drains the outbound queue to the remote authority.
//!
//! A tick never fails. Every error turns into a queue transition plus a log
//! record, and the next tick picks up from there.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use folio_common::{BatchRequest, ItemError, MutationIntent};
use folio_remote::RemoteAuthority;

use crate::config::FlushConfig;
use crate::outbox::Outbox;
use crate::pending::{PendingLog, PendingStatus};
use crate::session::Session;

/// Outcome of one flush tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Items sent to the remote.
    pub attempted: usize,
    pub applied: usize,
    pub failed: usize,
    /// Items dropped because their retry budget is spent.
    pub evicted: usize,
    /// Another flush was already running.
    pub skipped: bool,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.attempted == 0 && self.evicted == 0
    }
}

/// Resets the in-flight flag however the tick ends.
struct FlushingGuard<'a>(&'a AtomicBool);

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the queue in batches.
pub struct FlushDriver<R: RemoteAuthority + ?Sized> {
    remote: Arc<R>,
    outbox: Arc<Outbox>,
    pending: Arc<PendingLog>,
    session: Arc<Session>,
    config: FlushConfig,
    flushing: AtomicBool,
}

impl<R: RemoteAuthority + ?Sized> FlushDriver<R> {
    pub fn new(
        remote: Arc<R>,
        outbox: Arc<Outbox>,
        pending: Arc<PendingLog>,
        session: Arc<Session>,
        config: FlushConfig,
    ) -> Self {
        Self {
            remote,
            outbox,
            pending,
            session,
            config,
            flushing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Whether a tick is currently running.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Run one tick. Overlapping calls return immediately with
    /// [`FlushReport::skipped`] set.
    pub async fn flush(&self) -> FlushReport {
        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!("Flush already in progress, skipping");
            return FlushReport::skipped();
        }
        let _guard = FlushingGuard(&self.flushing);

        let mut report = FlushReport::default();
        let batch = match self.outbox.peek(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("Failed to read outbound queue: {}", e);
                return report;
            }
        };

        if batch.is_empty() {
            report.evicted = self.evict_when_idle().await;
            return report;
        }

        let max_retries = self.outbox.max_retries();
        let (eligible, over_budget): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|intent| !intent.is_stuck(max_retries));

        if eligible.is_empty() {
            for intent in &over_budget {
                log_drop(intent);
                if let Err(e) = self.outbox.remove(&intent.id).await {
                    error!("Failed to remove {}: {}", intent.id, e);
                }
            }
            report.evicted = over_budget.len();
            return report;
        }

        report.attempted = eligible.len();
        self.send(eligible, &mut report).await;
        report.evicted += self.evict_stuck().await;

        if !self.config.retain_applied && report.applied > 0 {
            if let Err(e) = self.outbox.clear_applied().await {
                warn!("Failed to compact applied items: {}", e);
            }
        }

        info!(
            "Flush completed: {} attempted, {} applied, {} failed, {} evicted",
            report.attempted, report.applied, report.failed, report.evicted
        );
        report
    }

    async fn send(&self, batch: Vec<MutationIntent>, report: &mut FlushReport) {
        let ids: Vec<String> = batch.iter().map(|intent| intent.id.clone()).collect();
        if let Err(e) = self.outbox.mark_syncing(&ids).await {
            error!("Failed to mark batch as syncing: {}", e);
            return;
        }
        self.mirror_status(&ids, PendingStatus::Syncing).await;

        let request = BatchRequest { changes: batch };
        let token = self.session.token().or_else(|| self.config.auth_token.clone());
        debug!("Pushing {} items to {}", ids.len(), self.remote.name());

        let response = match self.remote.push_batch(&request, token.as_deref()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Batch push failed: {}", e);
                let errors: Vec<ItemError> = ids
                    .iter()
                    .map(|id| ItemError {
                        id: id.clone(),
                        error: e.to_string(),
                    })
                    .collect();
                report.failed = self.fail(&errors).await;
                return;
            }
        };

        let sent: HashSet<&str> = ids.iter().map(String::as_str).collect();
        // responses are positional: keep them in step with the ids we keep
        let mut applied: Vec<String> = Vec::new();
        let mut responses: Option<Vec<Value>> = response.responses.as_ref().map(|_| Vec::new());
        for (i, id) in response.applied.iter().enumerate() {
            if !sent.contains(id.as_str()) {
                warn!("Remote reported unknown item {} as applied", id);
                continue;
            }
            applied.push(id.clone());
            if let (Some(kept), Some(all)) = (responses.as_mut(), response.responses.as_ref()) {
                kept.push(all.get(i).cloned().unwrap_or(Value::Null));
            }
        }
        let mut errors: Vec<ItemError> = response
            .errors
            .into_iter()
            .filter(|item| sent.contains(item.id.as_str()))
            .collect();

        // an item the remote did not report on must not stay in flight
        let reported: HashSet<&str> = applied
            .iter()
            .map(String::as_str)
            .chain(errors.iter().map(|item| item.id.as_str()))
            .collect();
        let unreported: Vec<ItemError> = ids
            .iter()
            .filter(|id| !reported.contains(id.as_str()))
            .map(|id| ItemError {
                id: id.clone(),
                error: "No outcome reported by remote".to_string(),
            })
            .collect();
        errors.extend(unreported);

        if !applied.is_empty() {
            match self
                .outbox
                .mark_applied(&applied, responses.as_deref())
                .await
            {
                Ok(()) => report.applied = applied.len(),
                Err(e) => error!("Failed to mark items applied: {}", e),
            }
            self.mirror_status(&applied, PendingStatus::Synced).await;
        }

        if !errors.is_empty() {
            report.failed = self.fail(&errors).await;
        }
    }

    async fn fail(&self, errors: &[ItemError]) -> usize {
        let backoff = self.config.backoff();
        if let Err(e) = self.outbox.mark_failed(errors, backoff.as_ref()).await {
            error!("Failed to mark items failed: {}", e);
            return 0;
        }
        if let Err(e) = self.pending.set_errors_for_intents(errors).await {
            warn!("Failed to record errors in pending log: {}", e);
        }
        errors.len()
    }

    async fn mirror_status(&self, ids: &[String], status: PendingStatus) {
        if let Err(e) = self.pending.set_status_for_intents(ids, status).await {
            warn!("Failed to update pending log to {}: {}", status, e);
        }
    }

    /// Drop items that just spent their last retry.
    async fn evict_stuck(&self) -> usize {
        match self.outbox.evict_stuck().await {
            Ok(evicted) => {
                evicted.iter().for_each(log_drop);
                evicted.len()
            }
            Err(e) => {
                error!("Failed to evict stuck items: {}", e);
                0
            }
        }
    }

    /// Nothing retryable is left: clear whatever is stuck.
    async fn evict_when_idle(&self) -> usize {
        let stuck = match self.outbox.stuck().await {
            Ok(stuck) => stuck,
            Err(e) => {
                error!("Failed to list stuck items: {}", e);
                return 0;
            }
        };
        if stuck.is_empty() {
            return 0;
        }
        stuck.iter().for_each(log_drop);

        // with backoff on, failed items may be waiting rather than stuck
        let cleared = if self.config.exponential_backoff {
            self.outbox.evict_stuck().await.map(|evicted| evicted.len())
        } else {
            self.outbox.clear_failed().await
        };
        cleared.unwrap_or_else(|e| {
            error!("Failed to clear stuck items: {}", e);
            0
        })
    }
}

fn log_drop(intent: &MutationIntent) {
    error!(
        table = %intent.table,
        operation = %intent.operation,
        retry_count = intent.retry_count,
        error = intent.error.as_deref().unwrap_or("unknown"),
        "Dropping mutation {} after exhausting retries",
        intent.id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{append, NewChange};
    use crate::store::LocalStore;
    use folio_common::{BatchResponse, IntentStatus, ManualClock, OperationKind};
    use folio_remote::MemoryRemote;
    use serde_json::json;

    struct Fixture {
        store: Arc<LocalStore>,
        outbox: Arc<Outbox>,
        pending: Arc<PendingLog>,
        remote: Arc<MemoryRemote>,
        driver: FlushDriver<MemoryRemote>,
    }

    fn fixture(config: FlushConfig) -> Fixture {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let outbox = Arc::new(Outbox::new(store.clone(), clock, config.max_retries));
        let pending = Arc::new(PendingLog::new(store.clone()));
        let remote = Arc::new(MemoryRemote::new());
        let driver = FlushDriver::new(
            remote.clone(),
            outbox.clone(),
            pending.clone(),
            Arc::new(Session::with_token("t")),
            config,
        );
        Fixture {
            store,
            outbox,
            pending,
            remote,
            driver,
        }
    }

    async fn write(fx: &Fixture, id: &str) -> MutationIntent {
        let payload = json!({"id": id, "title": id});
        let intent = fx
            .outbox
            .enqueue("works", OperationKind::Insert, payload.clone())
            .await
            .unwrap();
        fx.store
            .transaction(|tx| {
                append(
                    tx,
                    &NewChange {
                        table: "works",
                        entity_id: id,
                        operation: OperationKind::Insert,
                        timestamp: 1_000,
                        data: Some(&payload),
                        intent_id: Some(&intent.id),
                    },
                )
            })
            .await
            .unwrap();
        intent
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let fx = fixture(FlushConfig::default());
        let report = fx.driver.flush().await;
        assert!(report.is_idle());
        assert_eq!(fx.remote.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_flush_applies_and_compacts() {
        let fx = fixture(FlushConfig::default());
        write(&fx, "w1").await;
        write(&fx, "w2").await;

        let report = fx.driver.flush().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(fx.remote.rows("works").len(), 2);

        assert_eq!(fx.outbox.get_stats().await.unwrap().total, 0);
        let entries = fx.pending.list("works").await.unwrap();
        assert!(entries.iter().all(|e| e.status == PendingStatus::Synced));
    }

    #[tokio::test]
    async fn test_retain_applied_keeps_history() {
        let fx = fixture(FlushConfig {
            retain_applied: true,
            ..FlushConfig::default()
        });
        let intent = write(&fx, "w1").await;
        fx.driver.flush().await;

        let stored = fx.outbox.get(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Applied);
        assert!(stored.server_response.is_some());
    }

    /// Reports an extra id ahead of the real ones, with a response for each.
    struct StrayRemote;

    #[async_trait::async_trait]
    impl RemoteAuthority for StrayRemote {
        fn name(&self) -> &str {
            "stray"
        }

        async fn push_batch(
            &self,
            batch: &BatchRequest,
            _auth_token: Option<&str>,
        ) -> folio_common::Result<BatchResponse> {
            let mut applied = vec!["unknown".to_string()];
            let mut responses = vec![json!({"for": "unknown"})];
            for change in &batch.changes {
                applied.push(change.id.clone());
                responses.push(json!({"for": change.id}));
            }
            Ok(BatchResponse {
                applied,
                errors: Vec::new(),
                responses: Some(responses),
            })
        }
    }

    #[tokio::test]
    async fn test_responses_stay_aligned_with_unknown_ids() {
        let fx = fixture(FlushConfig::default());
        let first = write(&fx, "w1").await;
        let second = write(&fx, "w2").await;
        let driver = FlushDriver::new(
            Arc::new(StrayRemote),
            fx.outbox.clone(),
            fx.pending.clone(),
            Arc::new(Session::with_token("t")),
            FlushConfig {
                retain_applied: true,
                ..FlushConfig::default()
            },
        );

        let report = driver.flush().await;
        assert_eq!(report.applied, 2);

        for intent in [&first, &second] {
            let stored = fx.outbox.get(&intent.id).await.unwrap().unwrap();
            assert_eq!(stored.server_response, Some(json!({"for": intent.id})));
        }
    }

    #[tokio::test]
    async fn test_transport_failure_marks_whole_batch() {
        let fx = fixture(FlushConfig::default());
        write(&fx, "w1").await;
        write(&fx, "w2").await;
        fx.remote.set_online(false);

        let report = fx.driver.flush().await;
        assert_eq!(report.failed, 2);

        let stats = fx.outbox.get_stats().await.unwrap();
        assert_eq!(stats.count(IntentStatus::Error), 2);
        let entries = fx.pending.list("works").await.unwrap();
        assert!(entries.iter().all(|e| e.status == PendingStatus::Error));
        assert!(entries[0].error.as_deref().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_per_item_errors_do_not_block_others() {
        let fx = fixture(FlushConfig::default());
        let bad = write(&fx, "bad").await;
        write(&fx, "good").await;
        fx.remote.reject_entity("bad");

        let report = fx.driver.flush().await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);

        let peeked = fx.outbox.peek(10).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].id, bad.id);
        assert_eq!(peeked[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_stuck_items_are_evicted_after_max_retries() {
        let fx = fixture(FlushConfig {
            max_retries: 2,
            ..FlushConfig::default()
        });
        write(&fx, "w1").await;
        fx.remote.fail_batches_with(Some(500));

        let first = fx.driver.flush().await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.evicted, 0);

        let second = fx.driver.flush().await;
        assert_eq!(second.evicted, 1);
        assert_eq!(fx.outbox.get_stats().await.unwrap().total, 0);

        // the failed change stays visible locally until the error sweep
        let entries = fx.pending.list("works").await.unwrap();
        assert_eq!(entries[0].status, PendingStatus::Error);
    }

    #[tokio::test]
    async fn test_batch_size_limits_each_tick() {
        let fx = fixture(FlushConfig {
            batch_size: 2,
            ..FlushConfig::default()
        });
        for i in 0..5 {
            write(&fx, &format!("w{}", i)).await;
        }

        assert_eq!(fx.driver.flush().await.attempted, 2);
        assert_eq!(fx.driver.flush().await.attempted, 2);
        assert_eq!(fx.driver.flush().await.attempted, 1);
        assert_eq!(fx.remote.batch_count(), 3);
    }
}
