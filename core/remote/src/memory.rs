//! In-memory remote authority for testing and offline development.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

use folio_common::{
    BatchRequest, BatchResponse, Error, ItemError, MutationIntent, OperationKind, Result, Row,
    ID_FIELD,
};

use crate::predicate::Predicate;
use crate::provider::{FeedKey, FeedSource, RemoteAuthority, SnapshotStream};
use crate::shape::ShapeRegistry;

/// Column used for last-writer-wins comparison on the remote side.
const UPDATED_AT_COLUMN: &str = "updated_at";

#[derive(Debug, Clone, Default)]
struct TableFeed {
    /// Bumped on truncation; open streams from an older generation get a 409.
    generation: u64,
    rows: Arc<BTreeMap<String, Row>>,
}

/// In-memory remote authority.
///
/// Applies batches with last-writer-wins on `updated_at`, serves feeds with
/// simple predicates and column projection, and can be told to misbehave.
/// All data is lost on drop.
pub struct MemoryRemote {
    shapes: ShapeRegistry,
    tables: Mutex<HashMap<String, watch::Sender<TableFeed>>>,
    online: AtomicBool,
    fail_status: Mutex<Option<u16>>,
    rejected: Mutex<HashSet<String>>,
    batches: AtomicUsize,
    opens: AtomicUsize,
}

impl MemoryRemote {
    /// Create an empty, online remote.
    pub fn new() -> Self {
        Self::with_shapes(ShapeRegistry::new())
    }

    /// Create a remote that stores rows in the given wire shapes.
    pub fn with_shapes(shapes: ShapeRegistry) -> Self {
        Self {
            shapes,
            tables: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            fail_status: Mutex::new(None),
            rejected: Mutex::new(HashSet::new()),
            batches: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Answer every batch with this HTTP status (`None` to stop).
    pub fn fail_batches_with(&self, status: Option<u16>) {
        *self.fail_status.lock().unwrap() = status;
    }

    /// Reject every mutation targeting this entity id.
    pub fn reject_entity(&self, entity_id: impl Into<String>) {
        self.rejected.lock().unwrap().insert(entity_id.into());
    }

    /// Number of batches received, successful or not.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Number of feed streams requested, including refused ones.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Current remote rows of a table, in wire shape.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let sender = self.channel(table);
        let feed = sender.borrow();
        feed.rows.values().cloned().collect()
    }

    /// Replace a table's contents as if another client wrote them.
    pub fn publish(&self, table: &str, rows: Vec<Row>) {
        let sender = self.channel(table);
        let rows: BTreeMap<String, Row> = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get(ID_FIELD)?.as_str()?.to_string();
                Some((id, row))
            })
            .collect();
        sender.send_modify(|feed| feed.rows = Arc::new(rows));
    }

    /// Truncate a table; live feeds of it observe a conflict.
    pub fn truncate(&self, table: &str) {
        let sender = self.channel(table);
        sender.send_modify(|feed| {
            feed.generation += 1;
            feed.rows = Arc::new(BTreeMap::new());
        });
    }

    fn channel(&self, table: &str) -> watch::Sender<TableFeed> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(table.to_string())
            .or_insert_with(|| watch::channel(TableFeed::default()).0)
            .clone()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Network("Remote unreachable".to_string()))
        }
    }

    fn apply(&self, change: &MutationIntent) -> Result<Value> {
        let entity_id = change
            .entity_id()
            .ok_or_else(|| Error::InvalidInput("Missing id in payload".to_string()))?
            .to_string();
        if self.rejected.lock().unwrap().contains(&entity_id) {
            return Err(Error::Validation(format!("Rejected entity {}", entity_id)));
        }

        let payload = self.shapes.denormalize_payload(&change.table, &change.payload)?;
        let Value::Object(incoming) = payload else {
            return Err(Error::InvalidInput("Payload must be an object".to_string()));
        };

        let sender = self.channel(&change.table);
        let mut result = Value::Null;
        sender.send_modify(|feed| {
            let mut rows = (*feed.rows).clone();
            result = match change.operation {
                OperationKind::Insert | OperationKind::Update => {
                    let merged = upsert_lww(rows.get(&entity_id), incoming);
                    rows.insert(entity_id.clone(), merged.clone());
                    Value::Object(merged)
                }
                OperationKind::Delete => rows
                    .remove(&entity_id)
                    .map(Value::Object)
                    .unwrap_or(Value::Null),
            };
            feed.rows = Arc::new(rows);
        });
        Ok(result)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge an incoming write over the existing row unless the row is newer.
fn upsert_lww(existing: Option<&Row>, incoming: Map<String, Value>) -> Row {
    let Some(existing) = existing else {
        return incoming;
    };

    let server_ts = existing.get(UPDATED_AT_COLUMN).and_then(Value::as_i64).unwrap_or(0);
    let client_ts = incoming.get(UPDATED_AT_COLUMN).and_then(Value::as_i64).unwrap_or(0);
    if client_ts < server_ts {
        debug!("Skipping stale write, server row is newer");
        return existing.clone();
    }

    let mut merged = existing.clone();
    merged.extend(incoming);
    merged
}

#[async_trait]
impl RemoteAuthority for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push_batch(
        &self,
        batch: &BatchRequest,
        _auth_token: Option<&str>,
    ) -> Result<BatchResponse> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        if let Some(status) = *self.fail_status.lock().unwrap() {
            return Err(Error::Http {
                status,
                message: "Injected failure".to_string(),
            });
        }

        let mut response = BatchResponse::default();
        let mut responses = Vec::with_capacity(batch.changes.len());
        for change in &batch.changes {
            match self.apply(change) {
                Ok(row) => {
                    response.applied.push(change.id.clone());
                    responses.push(row);
                }
                Err(e) => response.errors.push(ItemError {
                    id: change.id.clone(),
                    error: e.to_string(),
                }),
            }
        }
        response.responses = Some(responses);
        Ok(response)
    }
}

#[async_trait]
impl FeedSource for MemoryRemote {
    async fn open(&self, key: &FeedKey) -> Result<SnapshotStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        let predicate = key.predicate.as_deref().map(Predicate::parse).transpose()?;
        let columns = key.columns.clone();
        let receiver = self.channel(&key.table).subscribe();
        let generation = receiver.borrow().generation;
        let table = key.table.clone();

        let stream = futures::stream::unfold(Some((receiver, true)), move |state| {
            let predicate = predicate.clone();
            let columns = columns.clone();
            let table = table.clone();
            async move {
                let (mut receiver, first) = state?;
                if !first && receiver.changed().await.is_err() {
                    return None;
                }
                let feed = receiver.borrow_and_update().clone();
                if feed.generation != generation {
                    let conflict = Error::FeedConflict(format!("Table {} was truncated", table));
                    return Some((Err(conflict), None));
                }

                let rows = feed
                    .rows
                    .values()
                    .filter(|row| predicate.as_ref().map_or(true, |p| p.matches(row)))
                    .map(|row| project(row, columns.as_deref()))
                    .collect();
                Some((Ok(rows), Some((receiver, false))))
            }
        });
        Ok(Box::pin(stream))
    }
}

fn project(row: &Row, columns: Option<&[String]>) -> Row {
    match columns {
        None => row.clone(),
        Some(columns) => row
            .iter()
            .filter(|(key, _)| key.as_str() == ID_FIELD || columns.iter().any(|c| c == *key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}
