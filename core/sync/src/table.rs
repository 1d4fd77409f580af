//! Typed write and read API over one table.
//!
//! Every write appends to the pending log and, while a session is active,
//! enqueues the same change for the remote, both in one store transaction.
//! Reads merge the synced mirror with the pending log.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

use folio_common::{
    Clock, EntityId, Error, MutationIntent, OperationKind, Result, ID_FIELD,
};

use crate::mirror::SyncedMirror;
use crate::outbox::insert_intent;
use crate::pending::{append, attach_intent, NewChange, PendingLog};
use crate::reconcile::{merge, MergedRow};
use crate::scheduler::FlushScheduler;
use crate::session::Session;
use crate::store::LocalStore;
use crate::tokens::TaskTokens;

/// A row type stored in one table.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table name, shared with the remote.
    const TABLE: &'static str;

    /// Partial update payload. Fields left out must not serialize.
    type Patch: Serialize + Send + Sync;

    fn id(&self) -> &str;

    /// Checked before an insert is recorded.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Checked before an update is recorded.
    fn validate_patch(_patch: &Self::Patch) -> Result<()> {
        Ok(())
    }
}

/// One local mutation of a table.
pub enum Mutation<E: Entity> {
    Insert(E),
    Update { id: String, patch: E::Patch },
    Delete(String),
}

/// What a write recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub local_id: i64,
    pub entity_id: String,
    pub timestamp: i64,
    /// Queue item created for the write. `None` when no session was active.
    pub intent_id: Option<String>,
}

/// Shared components a table handle writes through.
#[derive(Clone)]
pub(crate) struct TableContext {
    pub store: Arc<LocalStore>,
    pub pending: Arc<PendingLog>,
    pub mirror: Arc<SyncedMirror>,
    pub session: Arc<Session>,
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<TaskTokens>,
    pub updated_at_field: String,
    pub scheduler: Option<FlushScheduler>,
}

/// Typed handle on one table.
pub struct Table<E: Entity> {
    ctx: TableContext,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Table<E> {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self {
            ctx,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        E::TABLE
    }

    pub async fn insert(&self, entity: E) -> Result<WriteReceipt> {
        self.apply(Mutation::Insert(entity)).await
    }

    pub async fn update(&self, id: impl Into<String>, patch: E::Patch) -> Result<WriteReceipt> {
        self.apply(Mutation::Update {
            id: id.into(),
            patch,
        })
        .await
    }

    pub async fn delete(&self, id: impl Into<String>) -> Result<WriteReceipt> {
        self.apply(Mutation::Delete(id.into())).await
    }

    /// Record a mutation.
    ///
    /// # Errors
    /// - Validation failure (nothing is recorded)
    /// - Local store failure
    pub async fn apply(&self, mutation: Mutation<E>) -> Result<WriteReceipt> {
        let timestamp = self.ctx.clock.now_ms();
        let (entity_id, operation, data) = match mutation {
            Mutation::Insert(entity) => {
                entity.validate()?;
                let id = EntityId::new(entity.id())?;
                let mut row = to_object(&entity)?;
                row.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                row.insert(self.ctx.updated_at_field.clone(), Value::from(timestamp));
                (id, OperationKind::Insert, Some(Value::Object(row)))
            }
            Mutation::Update { id, patch } => {
                E::validate_patch(&patch)?;
                let id = EntityId::new(id)?;
                let mut row = to_object(&patch)?;
                row.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                row.insert(self.ctx.updated_at_field.clone(), Value::from(timestamp));
                (id, OperationKind::Update, Some(Value::Object(row)))
            }
            Mutation::Delete(id) => (EntityId::new(id)?, OperationKind::Delete, None),
        };

        let intent = self.ctx.session.is_active().then(|| {
            let payload = data
                .clone()
                .unwrap_or_else(|| serde_json::json!({ ID_FIELD: entity_id.as_str() }));
            MutationIntent::new(E::TABLE, operation, payload, timestamp)
        });

        let local_id = self
            .ctx
            .store
            .transaction(|tx| {
                if let Some(intent) = &intent {
                    insert_intent(tx, intent)?;
                }
                append(
                    tx,
                    &NewChange {
                        table: E::TABLE,
                        entity_id: entity_id.as_str(),
                        operation,
                        timestamp,
                        data: data.as_ref(),
                        intent_id: intent.as_ref().map(|i| i.id.as_str()),
                    },
                )
            })
            .await?;

        debug!(
            "Recorded {} {}/{} ({})",
            operation,
            E::TABLE,
            entity_id,
            if intent.is_some() { "queued" } else { "local only" }
        );
        if intent.is_some() {
            if let Some(scheduler) = &self.ctx.scheduler {
                scheduler.notify();
            }
        }

        Ok(WriteReceipt {
            local_id,
            entity_id: entity_id.to_string(),
            timestamp,
            intent_id: intent.map(|i| i.id),
        })
    }

    /// Merged view of the table.
    ///
    /// # Errors
    /// - Local store failure
    pub async fn query_rows(&self) -> Result<Vec<MergedRow>> {
        let synced = self.ctx.mirror.rows(E::TABLE).await?;
        let local = self.ctx.pending.list(E::TABLE).await?;
        Ok(merge(&synced, &local))
    }

    /// Merged view of the table. Empty when the store cannot be read.
    pub async fn query(&self) -> Vec<MergedRow> {
        self.query_rows().await.unwrap_or_else(|e| {
            warn!("Query of {} failed: {}", E::TABLE, e);
            Vec::new()
        })
    }

    /// One merged row by id.
    pub async fn get(&self, id: &str) -> Option<MergedRow> {
        self.query().await.into_iter().find(|row| row.id() == Some(id))
    }

    /// Merged rows decoded as entities. Rows that do not decode are skipped.
    pub async fn entities(&self) -> Vec<E> {
        self.query()
            .await
            .into_iter()
            .filter_map(|row| serde_json::from_value(Value::Object(row.row)).ok())
            .collect()
    }

    /// Like [`Table::query`], but returns `None` when a newer query for the
    /// same `key` started before this one finished.
    pub async fn query_latest(&self, key: &str) -> Option<Vec<MergedRow>> {
        let token = self.ctx.tokens.issue(format!("{}:{}", E::TABLE, key));
        let rows = self.query().await;
        self.ctx.tokens.accept(&token, rows)
    }

    /// Enqueue local-only changes recorded while no session was active.
    /// Never called implicitly.
    ///
    /// # Errors
    /// - No active session
    /// - Local store failure
    pub async fn requeue_local_only(&self) -> Result<usize> {
        if !self.ctx.session.is_active() {
            return Err(Error::InvalidInput(
                "Cannot requeue without an active session".to_string(),
            ));
        }

        let entries = self.ctx.pending.unqueued(E::TABLE).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let count = self
            .ctx
            .store
            .transaction(|tx| {
                for entry in &entries {
                    let payload = entry
                        .data
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({ ID_FIELD: entry.entity_id }));
                    let intent =
                        MutationIntent::new(E::TABLE, entry.operation, payload, entry.timestamp);
                    insert_intent(tx, &intent)?;
                    attach_intent(tx, entry.local_id, &intent.id)?;
                }
                Ok(entries.len())
            })
            .await?;

        info!("Requeued {} local-only changes of {}", count, E::TABLE);
        if let Some(scheduler) = &self.ctx.scheduler {
            scheduler.notify();
        }
        Ok(count)
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Validation("Payload must serialize to an object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;
    use crate::pending::PendingStatus;
    use folio_common::{IntentStatus, ManualClock};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Work {
        id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    }

    #[derive(Debug, Default, Serialize)]
    struct WorkPatch {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    }

    impl Entity for Work {
        const TABLE: &'static str = "works";
        type Patch = WorkPatch;

        fn id(&self) -> &str {
            &self.id
        }

        fn validate(&self) -> Result<()> {
            if self.title.trim().is_empty() {
                return Err(Error::Validation("title is required".to_string()));
            }
            Ok(())
        }

        fn validate_patch(patch: &WorkPatch) -> Result<()> {
            match &patch.title {
                Some(title) if title.trim().is_empty() => {
                    Err(Error::Validation("title cannot be blank".to_string()))
                }
                _ => Ok(()),
            }
        }
    }

    struct Fixture {
        table: Table<Work>,
        outbox: Outbox,
        session: Arc<Session>,
        mirror: Arc<SyncedMirror>,
        clock: Arc<ManualClock>,
    }

    fn fixture(signed_in: bool) -> Fixture {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(100));
        let session = Arc::new(if signed_in {
            Session::with_token("t")
        } else {
            Session::new()
        });
        let mirror = Arc::new(SyncedMirror::new(store.clone(), clock.clone()));
        let ctx = TableContext {
            store: store.clone(),
            pending: Arc::new(PendingLog::new(store.clone())),
            mirror: mirror.clone(),
            session: session.clone(),
            clock: clock.clone(),
            tokens: Arc::new(TaskTokens::new()),
            updated_at_field: "updatedAt".to_string(),
            scheduler: None,
        };
        Fixture {
            table: Table::new(ctx),
            outbox: Outbox::new(store, clock.clone(), 5),
            session,
            mirror,
            clock,
        }
    }

    fn work(id: &str, title: &str) -> Work {
        Work {
            id: id.to_string(),
            title: title.to_string(),
            author: None,
        }
    }

    #[tokio::test]
    async fn test_insert_records_and_queues() {
        let fx = fixture(true);
        let receipt = fx.table.insert(work("w1", "Dune")).await.unwrap();
        assert!(receipt.intent_id.is_some());
        assert_eq!(receipt.timestamp, 100);

        let queued = fx.outbox.peek(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload["updatedAt"], 100);
        assert_eq!(queued[0].entity_id(), Some("w1"));

        let rows = fx.table.query().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row["title"], "Dune");
        assert_eq!(rows[0].local.as_ref().unwrap().status, PendingStatus::Pending);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_recording() {
        let fx = fixture(true);
        let err = fx.table.insert(work("w1", " ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = fx
            .table
            .update(
                "w1",
                WorkPatch {
                    title: Some(String::new()),
                    ..WorkPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(matches!(
            fx.table.delete("").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(fx.table.query().await.is_empty());
        assert_eq!(fx.outbox.get_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_updates_accumulate_in_view() {
        let fx = fixture(true);
        fx.table.insert(work("w1", "Dune")).await.unwrap();
        fx.clock.advance(1);
        fx.table
            .update(
                "w1",
                WorkPatch {
                    title: Some("Dune Messiah".to_string()),
                    ..WorkPatch::default()
                },
            )
            .await
            .unwrap();
        fx.clock.advance(1);
        fx.table
            .update(
                "w1",
                WorkPatch {
                    author: Some("Herbert".to_string()),
                    ..WorkPatch::default()
                },
            )
            .await
            .unwrap();

        let row = fx.table.get("w1").await.unwrap();
        assert_eq!(row.row["title"], "Dune Messiah");
        assert_eq!(row.row["author"], "Herbert");
        assert_eq!(row.row["updatedAt"], 102);
        assert_eq!(fx.outbox.peek(10).await.unwrap().len(), 3);

        let entities = fx.table.entities().await;
        assert_eq!(entities[0].author.as_deref(), Some("Herbert"));
    }

    #[tokio::test]
    async fn test_delete_hides_synced_row() {
        let fx = fixture(true);
        fx.mirror
            .replace("works", &[json!({"id": "w1", "title": "Dune"}).as_object().cloned().unwrap()])
            .await
            .unwrap();
        assert_eq!(fx.table.query().await.len(), 1);

        fx.table.delete("w1").await.unwrap();
        assert!(fx.table.query().await.is_empty());

        let queued = fx.outbox.peek(10).await.unwrap();
        assert_eq!(queued[0].operation, OperationKind::Delete);
        assert_eq!(queued[0].payload, json!({"id": "w1"}));
    }

    #[tokio::test]
    async fn test_signed_out_writes_stay_local_until_requeued() {
        let fx = fixture(false);
        let receipt = fx.table.insert(work("w1", "Dune")).await.unwrap();
        assert!(receipt.intent_id.is_none());
        assert_eq!(fx.table.query().await.len(), 1);
        assert_eq!(fx.outbox.get_stats().await.unwrap().total, 0);

        assert!(fx.table.requeue_local_only().await.is_err());

        fx.session.begin("t");
        assert_eq!(fx.table.requeue_local_only().await.unwrap(), 1);
        assert_eq!(fx.table.requeue_local_only().await.unwrap(), 0);

        let queued = fx.outbox.peek(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, IntentStatus::Pending);
        assert_eq!(queued[0].created_at, 100);
    }

    #[tokio::test]
    async fn test_query_latest_returns_current_result() {
        let fx = fixture(true);
        fx.table.insert(work("w1", "Dune")).await.unwrap();
        let rows = fx.table.query_latest("list").await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
