//! Dispatch pipeline tests against the in-memory adapter.
//!
//! Run with: cargo test --test dispatch_memory

mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use relux::storage::MemoryAdapter;
use relux::{
    AggregateReducer, DraftEvent, StorageAdapter, StorageError, Store, StoreError, EVENT_LOG,
};

use common::{
    wait_until, AuditReducer, AuditTraceReducer, CollectingSubscriber, ExplodingReducer,
    FaultySubscriber, IssuesReducer, MalformedReducer, RogueReducer,
};

fn issues_aggregate() -> AggregateReducer {
    AggregateReducer::new()
        .with(Arc::new(IssuesReducer))
        .with(Arc::new(ExplodingReducer))
}

async fn collection_docs(adapter: &MemoryAdapter, collection: &str) -> Vec<serde_json::Value> {
    let mut session = adapter.begin().await.unwrap();
    let docs = session.find_all(collection).await.unwrap();
    session.rollback().await.unwrap();
    docs
}

#[tokio::test]
async fn enrichment_assigns_fresh_identity() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), adapter).unwrap();

    let start = Utc::now();
    let first = store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "x", "title": "T"})))
        .await
        .unwrap();
    let second = store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "y"})))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert!(first.timestamp >= start - chrono::Duration::seconds(1));
    assert_eq!(first.payload, json!({"id": "x", "title": "T"}));
}

#[tokio::test]
async fn client_supplied_identity_is_discarded() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), adapter).unwrap();

    let draft: DraftEvent = serde_json::from_value(json!({
        "type": "addIssue",
        "payload": {"id": "x"},
        "id": "11111111-1111-4111-8111-111111111111",
        "timestamp": "1999-01-01T00:00:00Z"
    }))
    .unwrap();

    let committed = store.dispatch(draft).await.unwrap();
    assert_ne!(
        committed.id.to_string(),
        "11111111-1111-4111-8111-111111111111"
    );
    assert!(committed.timestamp.timestamp() > 946684800); // well past 1999
}

#[tokio::test]
async fn reducer_failure_leaves_no_rows_anywhere() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), Arc::clone(&adapter) as _).unwrap();

    let err = store
        .dispatch(DraftEvent::new("boom", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Reducer { ref reducer, .. } if reducer == "exploding"));

    assert!(collection_docs(&adapter, "issues").await.is_empty());
    assert!(collection_docs(&adapter, EVENT_LOG).await.is_empty());
}

#[tokio::test]
async fn commit_failure_rolls_back_and_notifies_nobody() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), Arc::clone(&adapter) as _).unwrap();

    let collector = CollectingSubscriber::new();
    let _sub = store.subscribe(Arc::clone(&collector) as _).await;

    adapter.set_fail_on_commit(true);
    let err = store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "x"})))
        .await
        .unwrap_err();
    match err {
        StoreError::Persistence(storage) => assert!(storage.is_transient()),
        other => panic!("expected persistence error, got {other:?}"),
    }
    adapter.set_fail_on_commit(false);

    assert!(collection_docs(&adapter, "issues").await.is_empty());
    assert!(collection_docs(&adapter, EVENT_LOG).await.is_empty());

    // a later successful dispatch is the only thing subscribers see
    store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "y"})))
        .await
        .unwrap();
    wait_until("the successful batch", || !collector.batches().is_empty()).await;
    let batches = collector.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].payload, json!({"id": "y"}));
}

#[tokio::test]
async fn apply_failure_surfaces_as_persistence() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), Arc::clone(&adapter) as _).unwrap();

    adapter.set_fail_on_apply(true);
    let err = store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Persistence(StorageError::Transient(_))
    ));
}

#[tokio::test]
async fn failing_subscriber_does_not_starve_the_next_one() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), adapter).unwrap();

    let _faulty = store.subscribe(Arc::new(FaultySubscriber)).await;
    let collector = CollectingSubscriber::new();
    let _sub = store.subscribe(Arc::clone(&collector) as _).await;

    let committed = store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "x"})))
        .await
        .expect("subscriber failure must not surface to the dispatcher");

    wait_until("delivery to the second subscriber", || {
        !collector.batches().is_empty()
    })
    .await;
    assert_eq!(collector.batches()[0][0].id, committed.id);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), adapter).unwrap();

    let collector = CollectingSubscriber::new();
    let sub = store.subscribe(Arc::clone(&collector) as _).await;

    store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "x"})))
        .await
        .unwrap();
    wait_until("first delivery", || !collector.batches().is_empty()).await;

    sub.unsubscribe().await;
    store
        .dispatch(DraftEvent::new("addIssue", json!({"id": "y"})))
        .await
        .unwrap();

    // allow the notifier a moment; the second batch must not arrive
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(collector.batches().len(), 1);
}

#[tokio::test]
async fn empty_type_is_a_validation_error() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), Arc::clone(&adapter) as _).unwrap();

    let err = store
        .dispatch(DraftEvent::new("  ", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(collection_docs(&adapter, EVENT_LOG).await.is_empty());
}

#[tokio::test]
async fn empty_aggregate_is_a_configuration_error() {
    let adapter = Arc::new(MemoryAdapter::new());
    let err = Store::new(AggregateReducer::new(), adapter).unwrap_err();
    assert!(matches!(err, StoreError::Configuration(_)));
}

#[tokio::test]
async fn business_reducers_cannot_write_the_event_log() {
    let adapter = Arc::new(MemoryAdapter::new());
    let aggregate = AggregateReducer::new().with(Arc::new(RogueReducer));
    let store = Store::new(aggregate, Arc::clone(&adapter) as _).unwrap();

    let err = store
        .dispatch(DraftEvent::new("anything", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Reducer { ref reducer, .. } if reducer == "rogue"));
    assert!(collection_docs(&adapter, EVENT_LOG).await.is_empty());
}

#[tokio::test]
async fn malformed_changeset_is_attributed_to_its_reducer() {
    let adapter = Arc::new(MemoryAdapter::new());
    let aggregate = AggregateReducer::new().with(Arc::new(MalformedReducer));
    let store = Store::new(aggregate, Arc::clone(&adapter) as _).unwrap();

    let err = store
        .dispatch(DraftEvent::new("anything", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Reducer { ref reducer, .. } if reducer == "malformed"));
    assert!(collection_docs(&adapter, "broken").await.is_empty());
}

#[tokio::test]
async fn batch_dispatch_is_one_atomic_notified_unit() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Store::new(issues_aggregate(), Arc::clone(&adapter) as _).unwrap();

    let collector = CollectingSubscriber::new();
    let _sub = store.subscribe(Arc::clone(&collector) as _).await;

    let committed = store
        .dispatch_batch(vec![
            DraftEvent::new("addIssue", json!({"id": "x", "title": "T"})),
            DraftEvent::new("updateIssue", json!({"id": "x", "title": "U"})),
        ])
        .await
        .unwrap();
    assert_eq!(committed.len(), 2);

    let issues = collection_docs(&adapter, "issues").await;
    assert_eq!(issues, vec![json!({"id": "x", "title": "U"})]);
    assert_eq!(collection_docs(&adapter, EVENT_LOG).await.len(), 2);

    wait_until("batch delivery", || !collector.batches().is_empty()).await;
    let batches = collector.batches();
    assert_eq!(batches.len(), 1);
    let delivered: Vec<_> = batches[0].iter().map(|e| e.id).collect();
    let expected: Vec<_> = committed.iter().map(|e| e.id).collect();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn concurrent_dispatches_retry_conflicts_until_all_commit() {
    let adapter = Arc::new(MemoryAdapter::new());
    let store = Arc::new(Store::new(issues_aggregate(), Arc::clone(&adapter) as _).unwrap());

    let mut tasks = Vec::new();
    for n in 0..4 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            // overlapping snapshots conflict; retry until committed
            loop {
                let draft = DraftEvent::new("addIssue", json!({"id": format!("issue-{n}")}));
                match store.dispatch(draft).await {
                    Ok(event) => break event,
                    Err(StoreError::Persistence(err)) if err.is_transient() => continue,
                    Err(other) => panic!("dispatch failed: {other:?}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(collection_docs(&adapter, "issues").await.len(), 4);
    assert_eq!(store.events().await.unwrap().len(), 4);
}

#[tokio::test]
async fn replay_reproduces_collections_and_log() {
    let source_adapter = Arc::new(MemoryAdapter::new());
    let source = Store::new(
        AggregateReducer::new()
            .with(Arc::new(IssuesReducer))
            .with(Arc::new(AuditReducer))
            .with(Arc::new(AuditTraceReducer)),
        Arc::clone(&source_adapter) as _,
    )
    .unwrap();

    source
        .dispatch(DraftEvent::new("addIssue", json!({"id": "x", "title": "T"})))
        .await
        .unwrap();
    source
        .dispatch(DraftEvent::new("updateIssue", json!({"id": "x", "title": "U"})))
        .await
        .unwrap();
    source
        .dispatch(DraftEvent::new("touch", json!({})))
        .await
        .unwrap();
    source
        .dispatch(DraftEvent::new("addIssue", json!({"id": "y"})))
        .await
        .unwrap();

    let log = source.events().await.unwrap();
    assert_eq!(log.len(), 4);

    let replica_adapter = Arc::new(MemoryAdapter::new());
    let replica = Store::new(
        AggregateReducer::new()
            .with(Arc::new(IssuesReducer))
            .with(Arc::new(AuditReducer))
            .with(Arc::new(AuditTraceReducer)),
        Arc::clone(&replica_adapter) as _,
    )
    .unwrap();
    replica.replay(&log).await.unwrap();

    for collection in ["issues", "audit", "audit_trace", EVENT_LOG] {
        assert_eq!(
            collection_docs(&source_adapter, collection).await,
            collection_docs(&replica_adapter, collection).await,
            "collection '{collection}' diverged after replay"
        );
    }
    assert_eq!(replica.events().await.unwrap(), log);
}
