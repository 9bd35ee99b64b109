//! Relux - event-sourced dispatch over a relational database
//!
//! A Rust implementation of an event-sourcing layer for conventional
//! CRUD applications: dispatched events are durably logged, reduced
//! into database changesets, applied atomically, and pushed to
//! subscribers.

pub mod bootstrap;
pub mod changeset;
pub mod collection;
pub mod config;
pub mod error;
pub mod event;
pub mod reducer;
pub mod storage;
pub mod store;

pub use changeset::{Changeset, Operation, ReducerOutput};
pub use collection::{Collection, Document, EVENT_LOG};
pub use error::{ReducerError, StoreError};
pub use event::{DraftEvent, Event};
pub use reducer::{AggregateReducer, EventLogReducer, Reducer, ReducerContext};
pub use storage::{StorageAdapter, StorageError, StorageSession};
pub use store::{Store, Subscriber, SubscriptionHandle};
