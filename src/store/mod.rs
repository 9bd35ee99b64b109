//! The store façade.
//!
//! A `Store` binds one aggregate reducer to one storage adapter and
//! exposes `dispatch` and `subscribe`. Concurrent dispatches each own
//! their transaction; concurrency control is the storage engine's.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::collection::EVENT_LOG;
use crate::config::{Config, DEFAULT_NOTIFY_QUEUE_DEPTH};
use crate::error::StoreError;
use crate::event::{DraftEvent, Event};
use crate::reducer::{AggregateReducer, EventLogReducer};
use crate::storage::{StorageAdapter, StorageError};

mod dispatch;
mod notify;

pub use notify::{Subscriber, SubscriptionHandle};

use notify::{FnSubscriber, Notifier};

/// Process-wide façade binding one aggregate reducer to one storage
/// connection.
///
/// Must be constructed within a Tokio runtime; the notification
/// delivery task is spawned at construction and ends when the store is
/// dropped.
pub struct Store {
    reducers: AggregateReducer,
    log_reducer: EventLogReducer,
    adapter: Arc<dyn StorageAdapter>,
    notifier: Notifier,
    /// Serializes commit + notification enqueue so subscribers observe
    /// batches in commit order.
    commit_gate: Mutex<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Bind an aggregate reducer to a storage adapter.
    ///
    /// Fails with a configuration error when the aggregate has no
    /// registered reducers.
    pub fn new(
        reducers: AggregateReducer,
        adapter: Arc<dyn StorageAdapter>,
    ) -> Result<Self, StoreError> {
        Self::with_queue_depth(reducers, adapter, DEFAULT_NOTIFY_QUEUE_DEPTH)
    }

    /// Like [`new`], taking queue sizing from configuration.
    ///
    /// [`new`]: Store::new
    pub fn with_config(
        reducers: AggregateReducer,
        adapter: Arc<dyn StorageAdapter>,
        config: &Config,
    ) -> Result<Self, StoreError> {
        Self::with_queue_depth(reducers, adapter, config.notify_queue_depth)
    }

    /// Like [`new`], with an explicit notification queue depth.
    ///
    /// [`new`]: Store::new
    pub fn with_queue_depth(
        reducers: AggregateReducer,
        adapter: Arc<dyn StorageAdapter>,
        queue_depth: usize,
    ) -> Result<Self, StoreError> {
        if reducers.is_empty() {
            return Err(StoreError::Configuration(
                "aggregate reducer has no registered reducers".into(),
            ));
        }
        Ok(Self {
            reducers,
            log_reducer: EventLogReducer,
            adapter,
            notifier: Notifier::new(queue_depth),
            commit_gate: Mutex::new(()),
        })
    }

    /// Dispatch one event: enrich, reduce, persist atomically, notify.
    pub async fn dispatch(&self, draft: DraftEvent) -> Result<Event, StoreError> {
        let mut events = self.dispatch_batch(vec![draft]).await?;
        events
            .pop()
            .ok_or_else(|| StoreError::Validation("empty dispatch batch".into()))
    }

    /// Dispatch a batch of events as one atomic unit: one transaction,
    /// one log entry per event, one subscriber notification carrying
    /// the whole batch in dispatch order.
    pub async fn dispatch_batch(
        &self,
        drafts: Vec<DraftEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if draft.event_type.trim().is_empty() {
                return Err(StoreError::Validation(
                    "event 'type' must be a non-empty string".into(),
                ));
            }
            events.push(Event::enrich(draft));
        }

        let mut session = self.adapter.begin().await?;
        if let Err(err) =
            dispatch::run(&self.reducers, &self.log_reducer, session.as_mut(), &events).await
        {
            if let Err(rollback_err) = session.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after dispatch error");
            }
            error!(error = %err, "Dispatch failed; transaction rolled back");
            return Err(err);
        }

        let gate = self.commit_gate.lock().await;
        if let Err(err) = session.commit().await {
            drop(gate);
            error!(error = %err, "Commit failed; nothing persisted, nothing notified");
            return Err(StoreError::Persistence(err));
        }
        info!(event.count = events.len(), "Dispatch committed");
        self.notifier.publish(events.clone()).await;
        drop(gate);

        Ok(events)
    }

    /// Register a subscriber, invoked once per successful dispatch with
    /// that dispatch's committed batch.
    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionHandle {
        self.notifier.subscribe(subscriber).await
    }

    /// Register a plain closure as a subscriber.
    pub async fn subscribe_fn<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[Event]) + Send + Sync + 'static,
    {
        self.notifier.subscribe(Arc::new(FnSubscriber(callback))).await
    }

    /// Read back the persisted event log, oldest first.
    pub async fn events(&self) -> Result<Vec<Event>, StoreError> {
        let mut session = self.adapter.begin().await?;
        let docs = match session.find_all(EVENT_LOG).await {
            Ok(docs) => docs,
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed after log read error");
                }
                return Err(err.into());
            }
        };
        session.rollback().await.map_err(StoreError::Persistence)?;

        docs.into_iter()
            .map(|doc| {
                serde_json::from_value(doc).map_err(|e| {
                    StoreError::Persistence(StorageError::Backend(format!(
                        "corrupt event log entry: {e}"
                    )))
                })
            })
            .collect()
    }

    /// Re-run the aggregate reducer over already-enriched events,
    /// one transaction per event, skipping enrichment and subscriber
    /// notification. Against an empty datastore this reproduces the
    /// collections and the log of the original dispatch sequence.
    pub async fn replay(&self, events: &[Event]) -> Result<(), StoreError> {
        for event in events {
            let mut session = self.adapter.begin().await?;
            if let Err(err) = dispatch::run(
                &self.reducers,
                &self.log_reducer,
                session.as_mut(),
                std::slice::from_ref(event),
            )
            .await
            {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed during replay");
                }
                return Err(err);
            }
            session.commit().await.map_err(StoreError::Persistence)?;
        }
        info!(event.count = events.len(), "Replay complete");
        Ok(())
    }
}
