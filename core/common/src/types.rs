//! Common types used throughout the sync engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A table row as seen by the engine: a JSON object with a string `id`.
pub type Row = Map<String, Value>;

/// Name of the field every row is keyed by.
pub const ID_FIELD: &str = "id";

/// Extract the id of a row, if it carries a string one.
pub fn row_id(row: &Row) -> Option<&str> {
    row.get(ID_FIELD).and_then(Value::as_str)
}

/// Opaque identifier of an entity within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new EntityId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "EntityId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of mutation carried by a queue item or a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(crate::Error::Serialization(format!(
                "Unknown operation: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an outbound queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    /// Waiting for the next flush.
    Pending,
    /// Included in a batch currently in flight.
    Syncing,
    /// Accepted by the remote authority.
    Applied,
    /// Last attempt failed; eligible for retry while under budget.
    Error,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Syncing => "syncing",
            IntentStatus::Applied => "applied",
            IntentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "syncing" => Ok(IntentStatus::Syncing),
            "applied" => Ok(IntentStatus::Applied),
            "error" => Ok(IntentStatus::Error),
            other => Err(crate::Error::Serialization(format!(
                "Unknown intent status: {}",
                other
            ))),
        }
    }
}

/// A durable mutation waiting to be pushed to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub id: String,
    pub table: String,
    #[serde(rename = "op")]
    pub operation: OperationKind,
    pub payload: Value,
    pub created_at: i64,
    pub status: IntentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
}

impl MutationIntent {
    /// Create a fresh pending intent.
    pub fn new(
        table: impl Into<String>,
        operation: OperationKind,
        payload: Value,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table: table.into(),
            operation,
            payload,
            created_at,
            status: IntentStatus::Pending,
            applied_at: None,
            server_response: None,
            error: None,
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
        }
    }

    /// Id of the entity this intent targets, read from the payload.
    pub fn entity_id(&self) -> Option<&str> {
        self.payload.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Whether the retry budget is spent.
    pub fn is_stuck(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

/// Body of a batch write request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub changes: Vec<MutationIntent>,
}

/// Per-item failure reported by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub id: String,
    pub error: String,
}

/// Response of a batch write request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub applied: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Value>>,
}
