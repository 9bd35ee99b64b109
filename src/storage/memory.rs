//! In-memory storage adapter.
//!
//! Implements the full adapter contract over process memory. Used for
//! tests and for non-persistent callers that want to run reducers
//! against an in-memory collection set (the same reducer code that
//! runs against a real database).
//!
//! A session works on a snapshot of the shared state and swaps it back
//! on commit. The state carries a version stamp; a commit whose
//! snapshot is stale fails with a transient serialization conflict
//! instead of overwriting another session's committed writes, so
//! overlapping writers behave like they do under a real engine's
//! optimistic concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::changeset::{Changeset, Operation};
use crate::collection::{self, Document, EVENT_LOG};

use super::{shallow_merge, Result, StorageAdapter, StorageError, StorageSession};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    /// Incremented on every commit; a session may only commit against
    /// the version it snapshotted.
    version: u64,
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    events: Vec<Document>,
}

/// In-memory implementation of `StorageAdapter`.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
    fail_on_apply: Arc<AtomicBool>,
    fail_on_commit: Arc<AtomicBool>,
}

impl MemoryAdapter {
    /// Create an empty in-memory adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `apply` fail with a transient error.
    pub fn set_fail_on_apply(&self, fail: bool) {
        self.fail_on_apply.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `commit` fail with a transient error.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn begin(&self) -> Result<Box<dyn StorageSession>> {
        let working = self.state.lock().await.clone();
        Ok(Box::new(MemorySession {
            base: Arc::clone(&self.state),
            working,
            fail_on_apply: Arc::clone(&self.fail_on_apply),
            fail_on_commit: Arc::clone(&self.fail_on_commit),
        }))
    }
}

/// One open "transaction" against a `MemoryAdapter`.
pub struct MemorySession {
    base: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    fail_on_apply: Arc<AtomicBool>,
    fail_on_commit: Arc<AtomicBool>,
}

impl MemorySession {
    fn check_collection(name: &str) -> Result<()> {
        if collection::is_valid_name(name) {
            Ok(())
        } else {
            Err(StorageError::Constraint(format!(
                "invalid collection name '{name}'"
            )))
        }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn find_all(&mut self, collection: &str) -> Result<Vec<Document>> {
        Self::check_collection(collection)?;
        if collection == EVENT_LOG {
            return Ok(self.working.events.clone());
        }
        Ok(self
            .working
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_one(&mut self, collection: &str, key: &str) -> Result<Option<Document>> {
        Self::check_collection(collection)?;
        if collection == EVENT_LOG {
            return Ok(self
                .working
                .events
                .iter()
                .find(|event| event.get("id").and_then(Value::as_str) == Some(key))
                .cloned());
        }
        Ok(self
            .working
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn apply(&mut self, changeset: &Changeset) -> Result<()> {
        if self.fail_on_apply.load(Ordering::SeqCst) {
            return Err(StorageError::Transient("injected apply failure".into()));
        }
        Self::check_collection(&changeset.collection)?;

        if changeset.collection == EVENT_LOG {
            return match &changeset.operation {
                Operation::Create { data } => {
                    // same uniqueness the SQL backends get from the
                    // log table's primary key
                    let id = data
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            StorageError::Constraint("event log entry missing 'id'".into())
                        })?;
                    let duplicate = self
                        .working
                        .events
                        .iter()
                        .any(|event| event.get("id").and_then(Value::as_str) == Some(id));
                    if duplicate {
                        return Err(StorageError::Constraint(format!(
                            "duplicate event id '{id}' in the event log"
                        )));
                    }
                    self.working.events.push(data.clone());
                    Ok(())
                }
                Operation::NoChange => Ok(()),
                _ => Err(StorageError::Constraint(
                    "the event log is append-only".into(),
                )),
            };
        }

        let docs = self
            .working
            .collections
            .entry(changeset.collection.clone())
            .or_default();

        match &changeset.operation {
            Operation::Create { data } => {
                // validated by the pipeline; guard anyway
                let key = data
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StorageError::Constraint("create without 'id'".into()))?
                    .to_string();
                if docs.contains_key(&key) {
                    return Err(StorageError::Constraint(format!(
                        "duplicate key '{key}' in collection '{}'",
                        changeset.collection
                    )));
                }
                docs.insert(key, data.clone());
                Ok(())
            }
            Operation::Update { key, patch } => match docs.get_mut(key) {
                Some(doc) => {
                    shallow_merge(doc, patch);
                    Ok(())
                }
                None => Err(StorageError::Constraint(format!(
                    "update of missing key '{key}' in collection '{}'",
                    changeset.collection
                ))),
            },
            Operation::Delete { key } => {
                docs.remove(key);
                Ok(())
            }
            Operation::NoChange => Ok(()),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StorageError::Transient("injected commit failure".into()));
        }
        let mut working = std::mem::take(&mut self.working);
        let mut base = self.base.lock().await;
        if base.version != working.version {
            return Err(StorageError::Transient(
                "serialization conflict: state changed since the transaction began".into(),
            ));
        }
        working.version += 1;
        *base = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
