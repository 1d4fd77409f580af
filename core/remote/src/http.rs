//! HTTP remote authority client.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use folio_common::{BatchRequest, BatchResponse, Error, Result, Row};

use crate::provider::{FeedKey, FeedSource, RemoteAuthority, SnapshotStream};
use crate::shape::ShapeRegistry;

/// Path of the batch-write endpoint.
const WRITES_PATH: &str = "api/writes/batch";
/// Path of the shape (snapshot) endpoint.
const SHAPE_PATH: &str = "v1/shape";

/// Connection settings for [`HttpRemote`].
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// Base URL, e.g. `https://sync.example.com/`.
    pub base_url: Url,
    /// How often a feed polls for a new snapshot.
    pub poll_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpRemoteConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Remote authority reached over HTTP.
///
/// Batches are denormalized into the remote's wire shape before sending.
/// Feeds poll the shape endpoint and emit a snapshot whenever it changes.
pub struct HttpRemote {
    http: Client,
    config: HttpRemoteConfig,
    shapes: ShapeRegistry,
    feed_token: Option<String>,
}

impl HttpRemote {
    /// Create a new HTTP remote.
    ///
    /// # Errors
    /// - HTTP client construction failure
    pub fn new(config: HttpRemoteConfig, shapes: ShapeRegistry) -> Result<Self> {
        let http = Client::builder()
            .user_agent("Folio/0.1")
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            shapes,
            feed_token: None,
        })
    }

    /// Bearer token sent with feed requests.
    pub fn with_feed_token(mut self, token: impl Into<String>) -> Self {
        self.feed_token = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }
}

/// Map a response to its JSON body or a typed error.
async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)));
    }

    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
        return Err(Error::FeedConflict(message));
    }
    Err(Error::Http {
        status: status.as_u16(),
        message,
    })
}

async fn fetch_snapshot(
    http: &Client,
    url: &Url,
    key: &FeedKey,
    token: Option<&str>,
) -> Result<Vec<Row>> {
    let mut request = http.get(url.clone()).query(&[("table", key.table.as_str())]);
    if let Some(predicate) = &key.predicate {
        request = request.query(&[("where", predicate.as_str())]);
    }
    if let Some(columns) = &key.columns {
        request = request.query(&[("columns", columns.join(","))]);
    }
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::Network(format!("Failed to fetch shape {}: {}", key, e)))?;
    handle_response(response).await
}

#[async_trait]
impl RemoteAuthority for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn push_batch(
        &self,
        batch: &BatchRequest,
        auth_token: Option<&str>,
    ) -> Result<BatchResponse> {
        let url = self.endpoint(WRITES_PATH)?;

        let mut wire = batch.clone();
        for change in &mut wire.changes {
            change.payload = self.shapes.denormalize_payload(&change.table, &change.payload)?;
        }

        let mut request = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&wire);
        if let Some(token) = auth_token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        debug!("Pushing batch of {} changes", wire.changes.len());
        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to push batch: {}", e)))?;
        handle_response(response).await
    }
}

#[async_trait]
impl FeedSource for HttpRemote {
    async fn open(&self, key: &FeedKey) -> Result<SnapshotStream> {
        let url = self.endpoint(SHAPE_PATH)?;
        let http = self.http.clone();
        let token = self.feed_token.clone();
        let interval = self.config.poll_interval;
        let key = key.clone();

        // The first fetch happens here so connection failures surface from `open`.
        let initial = fetch_snapshot(&http, &url, &key, token.as_deref()).await?;

        let stream = futures::stream::unfold(
            Some((initial, true)),
            move |state| {
                let http = http.clone();
                let url = url.clone();
                let key = key.clone();
                let token = token.clone();
                async move {
                    let (last, first) = state?;
                    if first {
                        return Some((Ok(last.clone()), Some((last, false))));
                    }
                    loop {
                        tokio::time::sleep(interval).await;
                        match fetch_snapshot(&http, &url, &key, token.as_deref()).await {
                            Ok(rows) if rows == last => continue,
                            Ok(rows) => return Some((Ok(rows.clone()), Some((rows, false)))),
                            Err(e) => {
                                warn!("Feed {} poll failed: {}", key, e);
                                return Some((Err(e), None));
                            }
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}
