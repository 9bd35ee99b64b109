//! The built-in event-log reducer.
//!
//! Turns every dispatched event into an append to the reserved log
//! collection. The pipeline runs it last, after all registered
//! reducers, so the log append sees the same transaction but cannot be
//! skipped or shadowed by a misbehaving reducer. It is itself just a
//! reducer: the log is an ordinary collection, queryable like any
//! other, and replay reuses the same mechanism that produced it.

use async_trait::async_trait;

use crate::changeset::{Changeset, ReducerOutput};
use crate::collection::EVENT_LOG;
use crate::error::ReducerError;
use crate::event::Event;

use super::{Reducer, ReducerContext};

/// Appends every dispatched event to the event-log collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventLogReducer;

impl EventLogReducer {
    /// The log-append changeset for one enriched event.
    ///
    /// Deterministic: the same event always yields the same changeset.
    pub fn changeset_for(event: &Event) -> Result<Changeset, ReducerError> {
        let data = serde_json::to_value(event)
            .map_err(|e| ReducerError::Other(Box::new(e)))?;
        Ok(Changeset::create(EVENT_LOG, data))
    }
}

#[async_trait]
impl Reducer for EventLogReducer {
    fn name(&self) -> &str {
        "event_log"
    }

    fn collection(&self) -> &str {
        EVENT_LOG
    }

    async fn reduce(
        &self,
        _ctx: &mut ReducerContext<'_>,
        event: &Event,
    ) -> Result<ReducerOutput, ReducerError> {
        Ok(Self::changeset_for(event)?.into())
    }
}
