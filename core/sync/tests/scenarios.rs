//! End-to-end sync scenarios against the in-memory remote.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use folio_common::{ManualClock, OperationKind, Row};
use folio_remote::{FeedKey, MemoryRemote};
use folio_sync::{EngineConfig, Entity, FeedStatus, SyncEngine};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Work {
    id: String,
    a: String,
    b: String,
}

impl Entity for Work {
    const TABLE: &'static str = "works";
    type Patch = Value;

    fn id(&self) -> &str {
        &self.id
    }
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn engine(remote: Arc<MemoryRemote>, max_retries: u32) -> (SyncEngine<MemoryRemote>, Arc<ManualClock>) {
    let mut config = EngineConfig::default();
    config.flush.auth_token = Some("token".to_string());
    config.flush.max_retries = max_retries;
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = SyncEngine::with_clock(remote, config, clock.clone()).unwrap();
    (engine, clock)
}

async fn view(engine: &SyncEngine<MemoryRemote>, id: &str) -> Option<Value> {
    engine
        .table::<Work>()
        .get(id)
        .await
        .map(|merged| merged.into_value())
}

#[tokio::test]
async fn offline_create_and_two_updates_converge() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);
    let (engine, clock) = engine(remote.clone(), 5);
    let works = engine.table::<Work>();

    works
        .insert(Work {
            id: "e".to_string(),
            a: "old".to_string(),
            b: "old".to_string(),
        })
        .await
        .unwrap();
    clock.advance(1);
    works.update("e", json!({"a": "new"})).await.unwrap();
    clock.advance(1);
    works.update("e", json!({"b": "new"})).await.unwrap();

    let before = view(&engine, "e").await.unwrap();
    assert_eq!(before["a"], "new");
    assert_eq!(before["b"], "new");
    assert!(before.get("_local").is_some());

    // reconnect: the server has only applied the first update
    remote.set_online(true);
    remote.publish(
        "works",
        vec![row(json!({"id": "e", "a": "new", "b": "old", "updated_at": 1_001}))],
    );
    let mut feed = engine.subscribe(FeedKey::table("works")).await;
    feed.wait_for(|s| s.sync_status == FeedStatus::Synced && s.is_fresh_data)
        .await
        .unwrap();

    let after_feed = view(&engine, "e").await.unwrap();
    assert_eq!(after_feed["a"], "new");
    assert_eq!(after_feed["b"], "new");

    assert_eq!(engine.reconcile("works").await.unwrap(), 2);
    let after_cleanup = view(&engine, "e").await.unwrap();
    assert_eq!(after_cleanup["a"], "new");
    assert_eq!(after_cleanup["b"], "new");
    assert_eq!(after_cleanup["_local"]["timestamp"], 1_002);

    // the server catches up with the second update
    remote.publish(
        "works",
        vec![row(json!({"id": "e", "a": "new", "b": "new", "updated_at": 1_002}))],
    );
    feed.wait_for(|s| s.data.first().map(|r| r["b"] == "new").unwrap_or(false))
        .await
        .unwrap();

    assert_eq!(engine.reconcile("works").await.unwrap(), 1);
    let converged = view(&engine, "e").await.unwrap();
    assert_eq!(converged["b"], "new");
    assert!(converged.get("_local").is_none());
    assert!(engine.pending().list("works").await.unwrap().is_empty());
}

#[tokio::test]
async fn always_failing_server_evicts_everything_after_max_retries() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_batches_with(Some(500));
    let (engine, _clock) = engine(remote.clone(), 5);
    let works = engine.table::<Work>();

    for i in 0..6 {
        works
            .insert(Work {
                id: format!("w{}", i),
                a: "a".to_string(),
                b: "b".to_string(),
            })
            .await
            .unwrap();
    }

    for cycle in 1..=4 {
        let report = engine.flush_now().await;
        assert_eq!(report.failed, 6, "cycle {}", cycle);
        assert_eq!(report.evicted, 0, "cycle {}", cycle);
    }
    assert_eq!(engine.stats().await.unwrap().queue.total, 6);

    let last = engine.flush_now().await;
    assert_eq!(last.evicted, 6);
    assert!(engine.outbox().peek(10).await.unwrap().is_empty());
    assert_eq!(engine.stats().await.unwrap().queue.total, 0);
    assert_eq!(remote.batch_count(), 5);

    // nothing left to send
    assert!(engine.flush_now().await.is_idle());
    assert_eq!(remote.batch_count(), 5);
}

#[tokio::test]
async fn confirmed_delete_leaves_no_tombstone() {
    let remote = Arc::new(MemoryRemote::new());
    remote.publish("works", vec![row(json!({"id": "w1", "a": "x", "b": "y"}))]);
    let (engine, _clock) = engine(remote.clone(), 5);

    let mut feed = engine.subscribe(FeedKey::table("works")).await;
    feed.wait_for(|s| s.data.len() == 1).await.unwrap();
    assert!(view(&engine, "w1").await.is_some());

    engine.table::<Work>().delete("w1").await.unwrap();
    assert!(view(&engine, "w1").await.is_none());

    // still on the server: the tombstone must survive cleanup
    assert_eq!(engine.reconcile("works").await.unwrap(), 0);

    assert_eq!(engine.flush_now().await.applied, 1);
    feed.wait_for(|s| s.data.is_empty()).await.unwrap();

    assert_eq!(engine.reconcile("works").await.unwrap(), 1);
    assert!(engine.pending().list("works").await.unwrap().is_empty());
    assert!(view(&engine, "w1").await.is_none());
}

#[tokio::test]
async fn one_bad_mutation_does_not_block_the_queue() {
    let remote = Arc::new(MemoryRemote::new());
    remote.reject_entity("bad");
    let (engine, _clock) = engine(remote.clone(), 3);
    let works = engine.table::<Work>();

    for id in ["bad", "good"] {
        works
            .insert(Work {
                id: id.to_string(),
                a: "a".to_string(),
                b: "b".to_string(),
            })
            .await
            .unwrap();
    }

    let first = engine.flush_now().await;
    assert_eq!(first.applied, 1);
    assert_eq!(first.failed, 1);

    works
        .insert(Work {
            id: "later".to_string(),
            a: "a".to_string(),
            b: "b".to_string(),
        })
        .await
        .unwrap();
    let second = engine.flush_now().await;
    assert_eq!(second.applied, 1);

    engine.flush_now().await;
    assert_eq!(engine.stats().await.unwrap().queue.total, 0);

    let ids: Vec<String> = remote
        .rows("works")
        .into_iter()
        .filter_map(|r| r["id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(ids, vec!["good".to_string(), "later".to_string()]);

    // the rejected change stays visible locally with its error
    let bad = view(&engine, "bad").await.unwrap();
    assert_eq!(bad["_local"]["status"], "error");
    let entries = engine.pending().list("works").await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.entity_id == "bad" && e.operation == OperationKind::Insert));
}

#[tokio::test]
async fn shutdown_of_unstarted_engine_after_many_writes_returns() {
    let remote = Arc::new(MemoryRemote::new());
    let (engine, _clock) = engine(remote, 5);
    let works = engine.table::<Work>();

    for i in 0..120 {
        works
            .insert(Work {
                id: format!("w{}", i),
                a: "a".to_string(),
                b: "b".to_string(),
            })
            .await
            .unwrap();
    }

    tokio::time::timeout(std::time::Duration::from_secs(3), engine.shutdown())
        .await
        .expect("shutdown hung");
    assert_eq!(engine.stats().await.unwrap().queue.total, 120);
}
