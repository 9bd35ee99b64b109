//! Reducers and their aggregation.
//!
//! A reducer maps `(collection, event)` to changesets. It must be free
//! of side effects outside its return value; replay relies on that
//! purity. Business logic stays modular (one reducer per concern) while
//! the pipeline still gets one flat, ordered changeset list per event.

use std::sync::Arc;

use async_trait::async_trait;

use crate::changeset::ReducerOutput;
use crate::collection::Collection;
use crate::error::ReducerError;
use crate::event::Event;
use crate::storage::StorageSession;

pub mod event_log;

pub use event_log::EventLogReducer;

/// A pure function from `(collection, event)` to changesets.
///
/// Reducers are invoked in registration order with a context bound to
/// the dispatch's open transaction. Reads through the context observe
/// changesets already applied earlier in the same dispatch.
#[async_trait]
pub trait Reducer: Send + Sync {
    /// Name used to identify this reducer in errors and logs.
    fn name(&self) -> &str;

    /// The collection this reducer is scoped to; `ctx.collection()`
    /// resolves to it.
    fn collection(&self) -> &str;

    /// Derive changesets for one event.
    async fn reduce(
        &self,
        ctx: &mut ReducerContext<'_>,
        event: &Event,
    ) -> Result<ReducerOutput, ReducerError>;
}

/// Transaction-scoped view handed to a reducer.
///
/// Exposes the full collection set, not just the reducer's own
/// collection, so business-rule checks can join across collections
/// within the same transaction.
pub struct ReducerContext<'a> {
    session: &'a mut dyn StorageSession,
    scope: &'a str,
}

impl<'a> ReducerContext<'a> {
    pub(crate) fn new(session: &'a mut dyn StorageSession, scope: &'a str) -> Self {
        Self { session, scope }
    }

    /// The collection this reducer is scoped to.
    pub fn collection(&mut self) -> Collection<'_> {
        Collection::new(self.scope, &mut *self.session)
    }

    /// Any other collection, by name.
    pub fn collection_named<'b>(&'b mut self, name: &'b str) -> Collection<'b> {
        Collection::new(name, &mut *self.session)
    }
}

/// An ordered composition of reducers.
///
/// Conceptually a single composite reducer: every dispatched event is
/// fanned out to all members in registration order and their changesets
/// merged into one list. The event-log append is handled by the
/// pipeline and always runs last; it is not registered here.
#[derive(Default, Clone)]
pub struct AggregateReducer {
    reducers: Vec<Arc<dyn Reducer>>,
}

impl AggregateReducer {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reducer, preserving registration order.
    #[must_use]
    pub fn with(mut self, reducer: Arc<dyn Reducer>) -> Self {
        self.register(reducer);
        self
    }

    /// Append a reducer, preserving registration order.
    pub fn register(&mut self, reducer: Arc<dyn Reducer>) {
        self.reducers.push(reducer);
    }

    /// Member reducers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Reducer>> {
        self.reducers.iter()
    }

    /// Number of registered reducers.
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// Whether no reducer has been registered.
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}
