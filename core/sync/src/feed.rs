//! Change-feed subscriber.
//!
//! One pump task per [`FeedKey`] pulls full-table snapshots from the remote,
//! normalizes them, mirrors unfiltered tables locally and publishes the
//! result on a watch channel. Subscribers attach to the cached channel; the
//! pump outlives them until the key is evicted.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use folio_common::{Error, Result, Row};
use folio_remote::{FeedKey, FeedSource, ShapeRegistry};

use crate::backoff::Backoff;
use crate::config::FeedConfig;
use crate::mirror::SyncedMirror;

/// Attempts a one-shot snapshot fetch makes before giving up.
const SNAPSHOT_ATTEMPTS: u32 = 3;

/// Connection state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Connecting,
    Syncing,
    Synced,
    Error,
    /// The remote table was truncated. Data was cleared and the
    /// subscription reconnects.
    Conflict,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedStatus::Connecting => "connecting",
            FeedStatus::Syncing => "syncing",
            FeedStatus::Synced => "synced",
            FeedStatus::Error => "error",
            FeedStatus::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Reactive view of one subscription.
#[derive(Debug, Clone)]
pub struct FeedState {
    pub data: Arc<Vec<Row>>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub sync_status: FeedStatus,
    /// False while `data` comes from the local mirror rather than the remote.
    pub is_fresh_data: bool,
}

impl FeedState {
    fn connecting(seed: Vec<Row>) -> Self {
        Self {
            data: Arc::new(seed),
            is_loading: true,
            error: None,
            sync_status: FeedStatus::Connecting,
            is_fresh_data: false,
        }
    }
}

/// Broadcast to interested components when a table receives remote data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Fresh { table: String },
}

/// Consumer side of a subscription.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    key: FeedKey,
    rx: watch::Receiver<FeedState>,
}

impl FeedHandle {
    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> FeedState {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Result<FeedState> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::NotFound(format!("Subscription {} was evicted", self.key)))?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&FeedState) -> bool) -> Result<FeedState> {
        let state = self
            .rx
            .wait_for(predicate)
            .await
            .map_err(|_| Error::NotFound(format!("Subscription {} was evicted", self.key)))?;
        Ok(state.clone())
    }
}

struct Subscription {
    tx: watch::Sender<FeedState>,
    task: JoinHandle<()>,
}

/// What a pump task needs from its owner.
struct Pump<S: FeedSource + ?Sized> {
    source: Arc<S>,
    mirror: Arc<SyncedMirror>,
    shapes: Arc<ShapeRegistry>,
    events: broadcast::Sender<FeedEvent>,
    reconnect: Backoff,
    key: FeedKey,
    tx: watch::Sender<FeedState>,
}

impl<S: FeedSource + ?Sized> Pump<S> {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            self.tx.send_modify(|state| state.sync_status = FeedStatus::Connecting);

            let outcome = match self.source.open(&self.key).await {
                Ok(mut stream) => {
                    self.tx.send_modify(|state| state.sync_status = FeedStatus::Syncing);
                    loop {
                        match stream.next().await {
                            Some(Ok(rows)) => {
                                attempt = 0;
                                self.apply(rows).await;
                            }
                            Some(Err(e)) => break Err(e),
                            None => break Ok(()),
                        }
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => debug!("Feed {} ended, reconnecting", self.key),
                Err(Error::FeedConflict(msg)) => self.on_conflict(&msg).await,
                Err(e) => {
                    warn!("Feed {} failed: {}", self.key, e);
                    let message = e.to_string();
                    self.tx.send_modify(|state| {
                        state.is_loading = false;
                        state.error = Some(message);
                        state.sync_status = FeedStatus::Error;
                    });
                }
            }

            let delay = self.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            sleep(delay).await;
        }
    }

    async fn apply(&self, rows: Vec<Row>) {
        let table = &self.key.table;
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|row| self.shapes.normalize_row(table, row))
            .collect();

        let full_table = self.key.is_full_table();
        if full_table {
            if let Err(e) = self.mirror.replace(table, &rows).await {
                warn!("Failed to mirror {}: {}", table, e);
            }
        }

        debug!("Feed {} delivered {} rows", self.key, rows.len());
        self.tx.send_modify(|state| {
            state.data = Arc::new(rows);
            state.is_loading = false;
            state.error = None;
            state.sync_status = FeedStatus::Synced;
            state.is_fresh_data = true;
        });

        // filtered views never reach the mirror, so cleanup has nothing new to compare
        if full_table {
            let _ = self.events.send(FeedEvent::Fresh {
                table: table.clone(),
            });
        }
    }

    async fn on_conflict(&self, message: &str) {
        info!("Feed {} conflict: {}", self.key, message);
        if self.key.is_full_table() {
            if let Err(e) = self.mirror.clear(&self.key.table).await {
                warn!("Failed to clear mirror of {}: {}", self.key.table, e);
            }
        }
        let message = message.to_string();
        self.tx.send_modify(|state| {
            state.data = Arc::new(Vec::new());
            state.is_loading = true;
            state.error = Some(message);
            state.sync_status = FeedStatus::Conflict;
            state.is_fresh_data = false;
        });
    }
}

/// Cache of live subscriptions.
pub struct ChangeFeed<S: FeedSource + ?Sized> {
    source: Arc<S>,
    mirror: Arc<SyncedMirror>,
    shapes: Arc<ShapeRegistry>,
    config: FeedConfig,
    cache: Mutex<HashMap<FeedKey, Subscription>>,
    events: broadcast::Sender<FeedEvent>,
}

impl<S: FeedSource + ?Sized + 'static> ChangeFeed<S> {
    pub fn new(
        source: Arc<S>,
        mirror: Arc<SyncedMirror>,
        shapes: Arc<ShapeRegistry>,
        config: FeedConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            source,
            mirror,
            shapes,
            config,
            cache: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Receive [`FeedEvent`]s from every subscription.
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// Attach to the subscription for `key`, opening it if needed.
    pub async fn subscribe(&self, key: FeedKey) -> FeedHandle {
        let mut cache = self.cache.lock().await;
        if let Some(subscription) = cache.get(&key) {
            if !subscription.task.is_finished() {
                return FeedHandle {
                    rx: subscription.tx.subscribe(),
                    key,
                };
            }
        }

        let seed = if key.is_full_table() && self.config.seed_from_mirror {
            self.mirror.rows(&key.table).await.unwrap_or_else(|e| {
                warn!("Failed to seed {} from mirror: {}", key, e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let (tx, rx) = watch::channel(FeedState::connecting(seed));
        let pump = Pump {
            source: self.source.clone(),
            mirror: self.mirror.clone(),
            shapes: self.shapes.clone(),
            events: self.events.clone(),
            reconnect: self.config.reconnect.clone(),
            key: key.clone(),
            tx: tx.clone(),
        };
        let task = tokio::spawn(pump.run());
        info!("Opened feed subscription {}", key);

        cache.insert(key.clone(), Subscription { tx, task });
        FeedHandle { key, rx }
    }

    /// One-shot fetch of the first snapshot. Does not touch the cache or
    /// the mirror.
    pub async fn query_snapshot(&self, key: &FeedKey) -> Result<Vec<Row>> {
        let mut stream = self
            .config
            .reconnect
            .bounded(SNAPSHOT_ATTEMPTS)
            .retry(&format!("Snapshot of {}", key), || self.source.open(key))
            .await?;
        let rows = stream
            .next()
            .await
            .ok_or_else(|| Error::Network(format!("Feed {} closed before a snapshot", key)))??;

        Ok(rows
            .into_iter()
            .map(|row| self.shapes.normalize_row(&key.table, row))
            .collect())
    }

    /// Tear down one subscription. Returns whether it existed.
    pub async fn evict(&self, key: &FeedKey) -> bool {
        let removed = self.cache.lock().await.remove(key);
        match removed {
            Some(subscription) => {
                subscription.task.abort();
                info!("Evicted feed subscription {}", key);
                true
            }
            None => false,
        }
    }

    /// Tear down every subscription.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        for (_, subscription) in cache.drain() {
            subscription.task.abort();
        }
        debug!("Feed cache cleared");
    }

    /// Keys with a live pump.
    pub async fn active_keys(&self) -> Vec<FeedKey> {
        self.cache
            .lock()
            .await
            .iter()
            .filter(|(_, subscription)| !subscription.task.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }
}
