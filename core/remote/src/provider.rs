//! Remote authority trait definitions.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use folio_common::{BatchRequest, BatchResponse, Result, Row};

/// Stream of full-table snapshots, one item per feed update.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<Vec<Row>>> + Send>>;

/// Identity of a change-feed subscription.
///
/// Two subscriptions with equal keys share one underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedKey {
    /// Remote table name.
    pub table: String,
    /// Optional boolean filter expression, e.g. `work_id = 'w1'`.
    pub predicate: Option<String>,
    /// Optional column projection.
    pub columns: Option<Vec<String>>,
}

impl FeedKey {
    /// Subscribe to a whole table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: None,
            columns: None,
        }
    }

    /// Restrict the feed with a filter expression.
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Restrict the feed to a column subset.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Unfiltered, unprojected subscriptions are the only ones allowed to
    /// replace the local mirror of their table.
    pub fn is_full_table(&self) -> bool {
        self.predicate.is_none() && self.columns.is_none()
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)?;
        if let Some(predicate) = &self.predicate {
            write!(f, "|where={}", predicate)?;
        }
        if let Some(columns) = &self.columns {
            write!(f, "|columns={}", columns.join(","))?;
        }
        Ok(())
    }
}

/// Batch-write endpoint of the remote authority.
///
/// Implementations report transport failures as `Err` and per-item
/// rejections inside the [`BatchResponse`].
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Get the remote name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Push a batch of mutations.
    ///
    /// # Errors
    /// - Network errors
    /// - Non-success HTTP status for the batch as a whole
    async fn push_batch(&self, batch: &BatchRequest, auth_token: Option<&str>)
        -> Result<BatchResponse>;
}

/// Change-feed endpoint of the remote authority.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Open a snapshot stream for a feed key.
    ///
    /// The stream yields the full current contents matching the key on every
    /// update. A truncated table is reported as `Error::FeedConflict`.
    async fn open(&self, key: &FeedKey) -> Result<SnapshotStream>;
}
