//! Shared fixtures for dispatch integration tests.

// Not every test target exercises every fixture.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use relux::{
    Changeset, Event, Reducer, ReducerContext, ReducerError, ReducerOutput, Subscriber,
};

/// Maintains the `issues` collection from `addIssue` / `updateIssue` /
/// `removeIssue` events. Rejects a duplicate `addIssue` by checking the
/// current read model inside the dispatch transaction.
pub struct IssuesReducer;

#[async_trait]
impl Reducer for IssuesReducer {
    fn name(&self) -> &str {
        "issues"
    }

    fn collection(&self) -> &str {
        "issues"
    }

    async fn reduce(
        &self,
        ctx: &mut ReducerContext<'_>,
        event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        let mut issues = ctx.collection();
        match event.event_type.as_str() {
            "addIssue" => {
                let id = payload_id(event)?;
                if issues.find_one(&id).await?.is_some() {
                    return Err(ReducerError::Rejected(format!("issue '{id}' exists")));
                }
                Ok(issues.create(event.payload.clone()).into())
            }
            "updateIssue" => {
                let id = payload_id(event)?;
                let mut patch = event.payload.clone();
                if let Some(object) = patch.as_object_mut() {
                    object.remove("id");
                }
                Ok(issues.update(id, patch).into())
            }
            "removeIssue" => {
                let id = payload_id(event)?;
                Ok(issues.delete(id).into())
            }
            _ => Ok(issues.no_change().into()),
        }
    }
}

fn payload_id(event: &Event) -> Result<String, ReducerError> {
    event
        .payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ReducerError::Rejected("payload missing 'id'".into()))
}

/// Writes an audit row for `touch` events.
pub struct AuditReducer;

#[async_trait]
impl Reducer for AuditReducer {
    fn name(&self) -> &str {
        "audit"
    }

    fn collection(&self) -> &str {
        "audit"
    }

    async fn reduce(
        &self,
        ctx: &mut ReducerContext<'_>,
        event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        let audit = ctx.collection();
        match event.event_type.as_str() {
            "touch" => Ok(audit
                .create(json!({"id": "a1", "origin": "audit"}))
                .into()),
            _ => Ok(audit.no_change().into()),
        }
    }
}

/// Registered after `AuditReducer`; records whether it could observe
/// the audit row written earlier in the same dispatch.
pub struct AuditTraceReducer;

#[async_trait]
impl Reducer for AuditTraceReducer {
    fn name(&self) -> &str {
        "audit_trace"
    }

    fn collection(&self) -> &str {
        "audit_trace"
    }

    async fn reduce(
        &self,
        ctx: &mut ReducerContext<'_>,
        event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        if event.event_type != "touch" {
            return Ok(ctx.collection().no_change().into());
        }
        let saw_audit = ctx
            .collection_named("audit")
            .find_one("a1")
            .await?
            .is_some();
        Ok(ctx
            .collection()
            .create(json!({"id": "b1", "saw_audit": saw_audit}))
            .into())
    }
}

/// Fails every `boom` event with a business-rule rejection.
pub struct ExplodingReducer;

#[async_trait]
impl Reducer for ExplodingReducer {
    fn name(&self) -> &str {
        "exploding"
    }

    fn collection(&self) -> &str {
        "shrapnel"
    }

    async fn reduce(
        &self,
        ctx: &mut ReducerContext<'_>,
        event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        let shrapnel = ctx.collection();
        match event.event_type.as_str() {
            "boom" => Err(ReducerError::Rejected("kaboom".into())),
            _ => Ok(shrapnel.no_change().into()),
        }
    }
}

/// Tries to write directly into the reserved event-log collection.
pub struct RogueReducer;

#[async_trait]
impl Reducer for RogueReducer {
    fn name(&self) -> &str {
        "rogue"
    }

    fn collection(&self) -> &str {
        "rogue"
    }

    async fn reduce(
        &self,
        _ctx: &mut ReducerContext<'_>,
        _event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        Ok(Changeset::create(relux::EVENT_LOG, json!({"id": "forged"})).into())
    }
}

/// Returns a create changeset without an `id`.
pub struct MalformedReducer;

#[async_trait]
impl Reducer for MalformedReducer {
    fn name(&self) -> &str {
        "malformed"
    }

    fn collection(&self) -> &str {
        "broken"
    }

    async fn reduce(
        &self,
        _ctx: &mut ReducerContext<'_>,
        _event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        Ok(Changeset::create("broken", json!({"title": "no id"})).into())
    }
}

/// Subscriber that records every delivered batch.
#[derive(Default)]
pub struct CollectingSubscriber {
    batches: Mutex<Vec<Vec<Event>>>,
}

impl CollectingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscriber for CollectingSubscriber {
    async fn notify(
        &self,
        events: &[Event],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }
}

/// Subscriber that always fails.
pub struct FaultySubscriber;

#[async_trait]
impl Subscriber for FaultySubscriber {
    async fn notify(
        &self,
        _events: &[Event],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("subscriber exploded".into())
    }
}

/// Poll until `done` returns true, or panic after ~2 seconds.
/// Notification delivery is asynchronous; tests wait for it.
pub async fn wait_until(what: &str, done: impl Fn() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
