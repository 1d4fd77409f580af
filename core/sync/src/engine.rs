//! Sync engine that wires the queue, flush driver, change feed, pending log
//! and cleanup around one local store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use folio_common::{Clock, Error, Result, Row, SystemClock};
use folio_remote::{FeedKey, FeedSource, RemoteAuthority};

use crate::cleanup::Cleanup;
use crate::config::EngineConfig;
use crate::feed::{ChangeFeed, FeedEvent, FeedHandle};
use crate::flush::{FlushDriver, FlushReport};
use crate::mirror::SyncedMirror;
use crate::outbox::{Outbox, QueueStats};
use crate::pending::{PendingLog, PendingStatus};
use crate::scheduler::{FlushScheduler, FlushSchedulerHandle};
use crate::session::Session;
use crate::store::LocalStore;
use crate::table::{Entity, Table, TableContext};
use crate::tokens::TaskTokens;

/// Snapshot of engine health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub queue: QueueStats,
    pub pending: HashMap<PendingStatus, usize>,
    pub active_feeds: usize,
    pub cleanup_passes: u64,
    pub session_active: bool,
}

/// Main entry point of the sync engine.
pub struct SyncEngine<R: RemoteAuthority + FeedSource + ?Sized> {
    config: EngineConfig,
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    session: Arc<Session>,
    tokens: Arc<TaskTokens>,
    outbox: Arc<Outbox>,
    pending: Arc<PendingLog>,
    mirror: Arc<SyncedMirror>,
    flush: Arc<FlushDriver<R>>,
    feed: Arc<ChangeFeed<R>>,
    cleanup: Arc<Cleanup>,
    scheduler: FlushScheduler,
    scheduler_handle: Mutex<Option<FlushSchedulerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: RemoteAuthority + FeedSource + ?Sized + 'static> SyncEngine<R> {
    /// Create an engine using the system clock.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Local store cannot be opened
    pub fn new(remote: Arc<R>, config: EngineConfig) -> Result<Self> {
        Self::with_clock(remote, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(remote: Arc<R>, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(match &config.store_path {
            Some(path) => LocalStore::open(path)?,
            None => LocalStore::in_memory()?,
        });
        let session = Arc::new(match &config.flush.auth_token {
            Some(token) => Session::with_token(token.clone()),
            None => Session::new(),
        });

        let outbox = Arc::new(Outbox::new(
            store.clone(),
            clock.clone(),
            config.flush.max_retries,
        ));
        let pending = Arc::new(PendingLog::new(store.clone()));
        let mirror = Arc::new(SyncedMirror::new(store.clone(), clock.clone()));

        let flush = Arc::new(FlushDriver::new(
            remote.clone(),
            outbox.clone(),
            pending.clone(),
            session.clone(),
            config.flush.clone(),
        ));
        let feed = Arc::new(ChangeFeed::new(
            remote,
            mirror.clone(),
            Arc::new(config.shapes.clone()),
            config.feed.clone(),
        ));
        let cleanup = Arc::new(Cleanup::new(
            pending.clone(),
            mirror.clone(),
            clock.clone(),
            config.cleanup.clone(),
        ));
        let (scheduler, scheduler_handle) = FlushScheduler::new(config.flush.flush_interval);

        Ok(Self {
            config,
            store,
            clock,
            session,
            tokens: Arc::new(TaskTokens::new()),
            outbox,
            pending,
            mirror,
            flush,
            feed,
            cleanup,
            scheduler,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start background work: the flush scheduler, feed-triggered cleanup
    /// and the error sweep. Items left in flight by a previous run are
    /// returned to the queue first.
    ///
    /// # Errors
    /// - Engine already started
    /// - Local store failure during recovery
    pub async fn start(&self) -> Result<()> {
        let handle = self
            .scheduler_handle
            .lock()
            .map_err(|_| Error::InvalidInput("Engine state poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::InvalidInput("Engine already started".to_string()))?;

        self.outbox.recover_interrupted().await?;

        let flush = self.flush.clone();
        let scheduler_task = tokio::spawn(handle.run(move || {
            let flush = flush.clone();
            async move { flush.flush().await }
        }));
        let cleanup_task = self.cleanup.clone().spawn(self.feed.events());
        let sweep_task = self.cleanup.clone().spawn_error_sweep();

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend([scheduler_task, cleanup_task, sweep_task]);
        }
        info!("Sync engine started");
        Ok(())
    }

    /// Stop background work and close every feed subscription.
    pub async fn shutdown(&self) {
        // an unstarted scheduler still owns the receiver; drop it
        if let Ok(mut handle) = self.scheduler_handle.lock() {
            handle.take();
        }
        self.scheduler.shutdown().await;
        self.feed.clear_cache().await;
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("Sync engine stopped");
    }

    /// Typed handle on one table.
    pub fn table<E: Entity>(&self) -> Table<E> {
        Table::new(TableContext {
            store: self.store.clone(),
            pending: self.pending.clone(),
            mirror: self.mirror.clone(),
            session: self.session.clone(),
            clock: self.clock.clone(),
            tokens: self.tokens.clone(),
            updated_at_field: self.config.cleanup.updated_at_field.clone(),
            scheduler: Some(self.scheduler.clone()),
        })
    }

    /// Run one flush tick in the caller's task.
    pub async fn flush_now(&self) -> FlushReport {
        self.flush.flush().await
    }

    /// Ask the running scheduler for a tick and wait for it.
    pub async fn request_flush(&self) -> Result<FlushReport> {
        self.scheduler.request_flush().await
    }

    pub async fn subscribe(&self, key: FeedKey) -> FeedHandle {
        self.feed.subscribe(key).await
    }

    pub async fn query_snapshot(&self, key: &FeedKey) -> Result<Vec<Row>> {
        self.feed.query_snapshot(key).await
    }

    pub async fn evict_feed(&self, key: &FeedKey) -> bool {
        self.feed.evict(key).await
    }

    pub async fn clear_feed_cache(&self) {
        self.feed.clear_cache().await
    }

    pub fn feed_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed.events()
    }

    /// Prune confirmed pending entries of a table now.
    pub async fn reconcile(&self, table: &str) -> Result<usize> {
        self.cleanup.reconcile_table(table).await
    }

    /// Drop failed pending entries older than the error TTL now.
    pub async fn prune_errors(&self) -> Result<usize> {
        self.cleanup.prune_expired_errors().await
    }

    /// Hard-delete failed queue items.
    pub async fn clear_failed(&self) -> Result<usize> {
        self.outbox.clear_failed().await
    }

    pub fn begin_session(&self, token: impl Into<String>) {
        self.session.begin(token);
        self.scheduler.notify();
    }

    pub fn end_session(&self) {
        self.session.end();
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let queue = self.outbox.get_stats().await?;
        let pending = self.pending.counts().await?;
        let active_feeds = self.feed.active_keys().await.len();
        if !queue.stuck.is_empty() {
            warn!("{} queue items exhausted their retries", queue.stuck.len());
        }
        Ok(EngineStats {
            queue,
            pending,
            active_feeds,
            cleanup_passes: self.cleanup.passes(),
            session_active: self.session.is_active(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn pending(&self) -> &Arc<PendingLog> {
        &self.pending
    }

    pub fn mirror(&self) -> &Arc<SyncedMirror> {
        &self.mirror
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl<R: RemoteAuthority + FeedSource + ?Sized> Drop for SyncEngine<R> {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
