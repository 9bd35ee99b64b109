//! Changesets: pending, not-yet-applied mutations.
//!
//! A reducer never touches storage directly; it returns changesets and
//! the dispatch pipeline applies them inside the dispatch transaction.
//! Changesets are pure data and serialize cleanly, so a logged dispatch
//! can be re-derived during replay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::{self, Document};

/// The mutation a changeset describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Insert a new document. `data` must be an object carrying a
    /// non-empty string `id`.
    Create { data: Document },
    /// Shallow-merge `patch` into the document stored under `key`.
    Update { key: String, patch: Document },
    /// Remove the document stored under `key`.
    Delete { key: String },
    /// Explicit "nothing to do" marker. Reducers return this instead
    /// of returning nothing silently.
    NoChange,
}

/// A description of one pending mutation against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Target collection name.
    pub collection: String,
    /// The mutation to apply.
    pub operation: Operation,
}

/// A malformed changeset returned by a reducer.
#[derive(Debug, thiserror::Error)]
pub enum ChangesetError {
    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),

    #[error("collection '{0}' is reserved for the event log")]
    ReservedCollection(String),

    #[error("{op} data for collection '{collection}' must be a JSON object")]
    NotAnObject { collection: String, op: &'static str },

    #[error("create data for collection '{0}' must carry a non-empty string 'id'")]
    MissingId(String),

    #[error("{op} for collection '{collection}' has an empty key")]
    EmptyKey { collection: String, op: &'static str },
}

impl Changeset {
    /// Describe a document insert.
    pub fn create(collection: impl Into<String>, data: Document) -> Self {
        Self {
            collection: collection.into(),
            operation: Operation::Create { data },
        }
    }

    /// Describe a shallow-merge update of the document under `key`.
    pub fn update(collection: impl Into<String>, key: impl Into<String>, patch: Document) -> Self {
        Self {
            collection: collection.into(),
            operation: Operation::Update {
                key: key.into(),
                patch,
            },
        }
    }

    /// Describe a delete of the document under `key`.
    pub fn delete(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            operation: Operation::Delete { key: key.into() },
        }
    }

    /// The explicit no-change marker for a collection.
    pub fn no_change(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            operation: Operation::NoChange,
        }
    }

    /// Whether this changeset is the no-change marker.
    pub fn is_no_change(&self) -> bool {
        matches!(self.operation, Operation::NoChange)
    }

    /// Reject partially specified changesets before they reach storage.
    pub fn validate(&self) -> Result<(), ChangesetError> {
        if !collection::is_valid_name(&self.collection) {
            return Err(ChangesetError::InvalidCollection(self.collection.clone()));
        }
        match &self.operation {
            Operation::Create { data } => {
                let object = data
                    .as_object()
                    .ok_or_else(|| ChangesetError::NotAnObject {
                        collection: self.collection.clone(),
                        op: "create",
                    })?;
                match object.get("id").and_then(Value::as_str) {
                    Some(id) if !id.is_empty() => Ok(()),
                    _ => Err(ChangesetError::MissingId(self.collection.clone())),
                }
            }
            Operation::Update { key, patch } => {
                if key.is_empty() {
                    return Err(ChangesetError::EmptyKey {
                        collection: self.collection.clone(),
                        op: "update",
                    });
                }
                if !patch.is_object() {
                    return Err(ChangesetError::NotAnObject {
                        collection: self.collection.clone(),
                        op: "update",
                    });
                }
                Ok(())
            }
            Operation::Delete { key } => {
                if key.is_empty() {
                    return Err(ChangesetError::EmptyKey {
                        collection: self.collection.clone(),
                        op: "delete",
                    });
                }
                Ok(())
            }
            Operation::NoChange => Ok(()),
        }
    }
}

/// What a reducer returns: one changeset, several, or explicitly
/// nothing. There is no silent "returned nothing" state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerOutput {
    /// The reducer has nothing to contribute for this event.
    NoChange,
    /// A single changeset.
    One(Changeset),
    /// An ordered sequence of changesets.
    Many(Vec<Changeset>),
}

impl ReducerOutput {
    /// Flatten into the list of changesets to apply, dropping
    /// no-change markers.
    pub fn into_changesets(self) -> Vec<Changeset> {
        match self {
            ReducerOutput::NoChange => Vec::new(),
            ReducerOutput::One(changeset) => {
                if changeset.is_no_change() {
                    Vec::new()
                } else {
                    vec![changeset]
                }
            }
            ReducerOutput::Many(changesets) => changesets
                .into_iter()
                .filter(|changeset| !changeset.is_no_change())
                .collect(),
        }
    }
}

impl From<Changeset> for ReducerOutput {
    fn from(changeset: Changeset) -> Self {
        ReducerOutput::One(changeset)
    }
}

impl From<Vec<Changeset>> for ReducerOutput {
    fn from(changesets: Vec<Changeset>) -> Self {
        ReducerOutput::Many(changesets)
    }
}
