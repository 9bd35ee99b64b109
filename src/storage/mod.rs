//! Storage adapters.
//!
//! The dispatch pipeline consumes storage through two narrow traits: an
//! adapter that opens transactions, and a session representing one open
//! transaction that can read collections, apply changesets, and commit
//! or roll back. Concrete adapters translate changeset operations into
//! their engine's primitives.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::changeset::Changeset;
use crate::collection::Document;
use crate::config::{StorageConfig, StorageType};

pub mod memory;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryAdapter;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors reported by storage adapters.
///
/// The taxonomy distinguishes failures that retrying cannot fix
/// (constraint violations) from transient ones (connectivity loss,
/// serialization conflicts, timeouts). Retry policy itself is the
/// caller's concern.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Constraint or shape violation. Not retry-worthy.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Connectivity loss, serialization conflict, or timeout.
    /// Retry-worthy.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Anything else the backend reported.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether a retry of the failed dispatch could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::CheckViolation => {
                    StorageError::Constraint(db.to_string())
                }
                // SQLSTATE 40001: serialization failure, worth retrying
                _ if db.code().as_deref() == Some("40001") => {
                    StorageError::Transient(db.to_string())
                }
                _ => StorageError::Backend(db.to_string()),
            },
            sqlx::Error::Io(e) => StorageError::Transient(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                StorageError::Transient(err.to_string())
            }
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Interface for opening dispatch transactions.
///
/// Implementations:
/// - `SqliteAdapter`: SQLite storage
/// - `PostgresAdapter`: PostgreSQL storage
/// - `MemoryAdapter`: In-memory adapter for tests and non-persistent
///   callers
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Open a transaction scope. The returned session must be released
    /// through `commit` or `rollback` on every exit path.
    async fn begin(&self) -> Result<Box<dyn StorageSession>>;
}

/// One open transaction against the storage engine.
///
/// Reads observe writes already applied within the same session, which
/// is what lets a later reducer see an earlier reducer's changeset.
#[async_trait]
pub trait StorageSession: Send {
    /// All documents in a collection, as visible to this transaction.
    async fn find_all(&mut self, collection: &str) -> Result<Vec<Document>>;

    /// The document stored under `key`, as visible to this transaction.
    async fn find_one(&mut self, collection: &str, key: &str) -> Result<Option<Document>>;

    /// Apply one changeset within this transaction. A no-change
    /// changeset is a no-op.
    async fn apply(&mut self, changeset: &Changeset) -> Result<()>;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back the transaction, discarding every applied changeset.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Shallow-merge `patch` into `doc` at the top level. Both are
/// expected to be JSON objects; patch keys overwrite existing ones.
pub(crate) fn shallow_merge(doc: &mut Document, patch: &Document) {
    if let (Some(target), Some(source)) = (doc.as_object_mut(), patch.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Flattened event-log row for the SQL backends, per the persisted
/// table layout: `id`, `timestamp`, `type`, `payload`, `meta`.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) struct EventRow {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    pub payload: String,
    pub meta: Option<String>,
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl EventRow {
    /// Split a serialized event document into log-table columns. The
    /// timestamp is normalized to a fixed-width RFC 3339 string so the
    /// column sorts lexicographically in insertion order.
    pub fn from_doc(data: &Document) -> Result<Self> {
        let field = |name: &str| {
            data.get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    StorageError::Constraint(format!("event log entry missing '{name}'"))
                })
        };
        let timestamp = chrono::DateTime::parse_from_rfc3339(&field("timestamp")?)
            .map_err(|e| StorageError::Constraint(format!("bad event timestamp: {e}")))?
            .with_timezone(&chrono::Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let payload = data.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        let meta = match data.get("meta") {
            Some(serde_json::Value::Null) | None => None,
            Some(meta) => Some(serde_json::to_string(meta).map_err(|e| {
                StorageError::Backend(format!("meta serialization failed: {e}"))
            })?),
        };
        Ok(Self {
            id: field("id")?,
            timestamp,
            event_type: field("type")?,
            payload: serde_json::to_string(&payload)
                .map_err(|e| StorageError::Backend(format!("payload serialization failed: {e}")))?,
            meta,
        })
    }

    /// Rebuild the event document from log-table columns.
    pub fn into_doc(self) -> Result<Document> {
        let payload: serde_json::Value = serde_json::from_str(&self.payload)
            .map_err(|e| StorageError::Backend(format!("corrupt event payload: {e}")))?;
        let mut doc = serde_json::Map::new();
        doc.insert("id".into(), self.id.into());
        doc.insert("timestamp".into(), self.timestamp.into());
        doc.insert("type".into(), self.event_type.into());
        doc.insert("payload".into(), payload);
        if let Some(meta) = self.meta {
            let meta: serde_json::Value = serde_json::from_str(&meta)
                .map_err(|e| StorageError::Backend(format!("corrupt event meta: {e}")))?;
            doc.insert("meta".into(), meta);
        }
        Ok(serde_json::Value::Object(doc))
    }
}

/// Initialize a storage adapter based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn StorageAdapter>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: memory");
            Ok(Arc::new(MemoryAdapter::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            info!("Storage: sqlite at {}", config.path);
            let adapter = SqliteAdapter::connect(&config.path).await?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::Backend("sqlite feature not enabled".into()))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            info!("Storage: postgres at {}", config.uri);
            let adapter = PostgresAdapter::connect(&config.uri).await?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(feature = "postgres"))]
        StorageType::Postgres => {
            tracing::error!("PostgreSQL storage requested but 'postgres' feature is not enabled");
            Err(StorageError::Backend("postgres feature not enabled".into()))
        }
    }
}
