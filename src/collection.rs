//! Collection handles.
//!
//! A `Collection` is a thin typed handle over one logical table. Reads
//! go through the dispatch's open storage session; mutation helpers are
//! pure and only build changesets for the pipeline to apply.

use serde_json::Value;

use crate::changeset::Changeset;
use crate::storage::{StorageError, StorageSession};

/// Documents are opaque structured values; shape validation is a
/// reducer's concern, not the pipeline's.
pub type Document = Value;

/// Name of the reserved event-log collection.
pub const EVENT_LOG: &str = "events";

/// Whether `name` is usable as a collection name (and therefore as
/// part of a table identifier).
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A handle to one collection, bound to the in-flight transaction.
pub struct Collection<'a> {
    name: &'a str,
    session: &'a mut dyn StorageSession,
}

impl<'a> Collection<'a> {
    pub(crate) fn new(name: &'a str, session: &'a mut dyn StorageSession) -> Self {
        Self { name, session }
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// All documents currently visible to the open transaction.
    pub async fn find_all(&mut self) -> Result<Vec<Document>, StorageError> {
        self.session.find_all(self.name).await
    }

    /// The document stored under `key`, if any, as visible to the open
    /// transaction.
    pub async fn find_one(&mut self, key: &str) -> Result<Option<Document>, StorageError> {
        self.session.find_one(self.name, key).await
    }

    /// Build a create changeset for this collection.
    pub fn create(&self, data: Document) -> Changeset {
        Changeset::create(self.name, data)
    }

    /// Build an update changeset for this collection.
    pub fn update(&self, key: impl Into<String>, patch: Document) -> Changeset {
        Changeset::update(self.name, key, patch)
    }

    /// Build a delete changeset for this collection.
    pub fn delete(&self, key: impl Into<String>) -> Changeset {
        Changeset::delete(self.name, key)
    }

    /// The explicit no-change marker for this collection.
    pub fn no_change(&self) -> Changeset {
        Changeset::no_change(self.name)
    }
}
