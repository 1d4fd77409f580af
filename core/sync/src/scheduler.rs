//! Flush scheduling: fixed-interval ticks plus on-demand requests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use folio_common::{Error, Result};

use crate::flush::FlushReport;

/// Requests accepted by the scheduler task.
#[derive(Debug)]
pub enum FlushRequest {
    /// Run a tick now.
    Flush,
    /// Stop the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<FlushReport>;

/// Client side of the scheduler.
#[derive(Clone)]
pub struct FlushScheduler {
    request_tx: mpsc::Sender<(FlushRequest, Option<Reply>)>,
    shutdown: Arc<RwLock<bool>>,
}

impl FlushScheduler {
    /// Create a scheduler ticking every `period`.
    pub fn new(period: Duration) -> (Self, FlushSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = FlushSchedulerHandle {
            period,
            request_rx: Some(request_rx),
            shutdown,
        };
        (scheduler, handle)
    }

    /// Run a tick now and wait for its report.
    pub async fn request_flush(&self) -> Result<FlushReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((FlushRequest::Flush, Some(response_tx)))
            .await
            .map_err(|_| Error::InvalidInput("Flush scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Flush scheduler dropped the request".to_string()))
    }

    /// Ask for a tick without waiting. Dropped if the scheduler is busy
    /// with a backlog of requests.
    pub fn notify(&self) {
        if self.request_tx.try_send((FlushRequest::Flush, None)).is_err() {
            debug!("Flush notification dropped");
        }
    }

    /// Stop the scheduler task. Never waits on the request channel; a full
    /// backlog still stops the loop through the shutdown flag.
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        if self
            .request_tx
            .try_send((FlushRequest::Shutdown, None))
            .is_err()
        {
            debug!("Shutdown request not queued, relying on flag");
        }
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.shutdown.read().await
    }
}

/// Task side of the scheduler.
pub struct FlushSchedulerHandle {
    period: Duration,
    request_rx: Option<mpsc::Receiver<(FlushRequest, Option<Reply>)>>,
    shutdown: Arc<RwLock<bool>>,
}

impl FlushSchedulerHandle {
    /// Run the scheduler loop. Spawn this in a tokio task; `flush_fn` runs
    /// one tick.
    pub async fn run<F, Fut>(mut self, flush_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlushReport> + Send,
    {
        let Some(mut request_rx) = self.request_rx.take() else {
            return;
        };
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Flush scheduler started ({:?} interval)", self.period);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Some((FlushRequest::Flush, reply)) => {
                            let report = flush_fn().await;
                            if let Some(reply) = reply {
                                let _ = reply.send(report);
                            }
                        }
                        Some((FlushRequest::Shutdown, _)) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    let report = flush_fn().await;
                    if !report.is_idle() {
                        debug!("Periodic flush: {:?}", report);
                    }
                }
            }
        }

        info!("Flush scheduler stopped");
    }
}
