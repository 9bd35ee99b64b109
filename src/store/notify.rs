//! Subscriber registry and notification delivery.
//!
//! Committed batches are pushed onto a bounded in-process queue and
//! delivered by a single notifier task, so subscribers observe batches
//! in commit order even when concurrent dispatches commit out of
//! submission order. Subscriber failures are logged and isolated; they
//! never reach the dispatch caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::event::Event;

/// A callback registered with a store, invoked once per successful
/// dispatch with that dispatch's batch of committed events.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one committed batch. The batch preserves dispatch order.
    async fn notify(
        &self,
        events: &[Event],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Adapts a plain closure to the `Subscriber` trait.
pub(crate) struct FnSubscriber<F>(pub F);

#[async_trait]
impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&[Event]) + Send + Sync,
{
    async fn notify(
        &self,
        events: &[Event],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (self.0)(events);
        Ok(())
    }
}

type SubscriberMap = BTreeMap<u64, Arc<dyn Subscriber>>;

/// Handle returned by `subscribe`; consumes itself to unsubscribe.
///
/// Dropping the handle leaves the subscription active for the store's
/// lifetime.
pub struct SubscriptionHandle {
    id: u64,
    subscribers: Weak<RwLock<SubscriberMap>>,
}

impl SubscriptionHandle {
    /// Remove the subscription. A no-op if the store is already gone.
    pub async fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().await.remove(&self.id);
        }
    }
}

/// Owns the subscriber set and the delivery queue.
pub(crate) struct Notifier {
    subscribers: Arc<RwLock<SubscriberMap>>,
    tx: mpsc::Sender<Vec<Event>>,
    next_id: AtomicU64,
}

impl Notifier {
    /// Create the notifier and spawn its delivery task. The task ends
    /// when the notifier (the queue's only sender) is dropped.
    pub fn new(queue_depth: usize) -> Self {
        let subscribers: Arc<RwLock<SubscriberMap>> = Arc::default();
        let (tx, mut rx) = mpsc::channel::<Vec<Event>>(queue_depth.max(1));

        let delivery_set = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let targets: Vec<(u64, Arc<dyn Subscriber>)> = {
                    let guard = delivery_set.read().await;
                    guard
                        .iter()
                        .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
                        .collect()
                };
                for (id, subscriber) in targets {
                    if let Err(e) = subscriber.notify(&batch).await {
                        warn!(
                            subscriber.id = id,
                            error = %e,
                            "Subscriber failed; continuing delivery"
                        );
                    }
                }
            }
        });

        Self {
            subscribers,
            tx,
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(id, subscriber);
        SubscriptionHandle {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Enqueue one committed batch for delivery. Applies backpressure
    /// when the queue is full.
    pub async fn publish(&self, batch: Vec<Event>) {
        if self.tx.send(batch).await.is_err() {
            warn!("Notification queue closed; dropping committed batch");
        }
    }
}
