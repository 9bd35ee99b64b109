//! Error taxonomy for dispatch.
//!
//! Every failure during a dispatch rolls back the whole transaction;
//! partial application is never observable. Subscriber callback
//! failures are logged and isolated, they never surface here.

use crate::changeset::ChangesetError;
use crate::storage::StorageError;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced to the dispatch caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed input event; nothing was persisted.
    #[error("invalid event: {0}")]
    Validation(String),

    /// A reducer failed or returned an invalid changeset shape; the
    /// dispatch transaction was rolled back.
    #[error("reducer '{reducer}' failed: {source}")]
    Reducer {
        reducer: String,
        #[source]
        source: ReducerError,
    },

    /// Transaction or commit failure at the storage adapter; the
    /// dispatch transaction was rolled back. Check
    /// [`StorageError::is_transient`] to decide retry-worthiness.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StorageError),

    /// Invalid store construction.
    #[error("invalid store configuration: {0}")]
    Configuration(String),
}

/// Errors a reducer can produce.
#[derive(Debug, thiserror::Error)]
pub enum ReducerError {
    /// A business rule rejected the event.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The reducer returned a malformed changeset.
    #[error("invalid changeset: {0}")]
    InvalidChangeset(#[from] ChangesetError),

    /// A transaction-scoped read failed. The pipeline surfaces this as
    /// a persistence failure rather than blaming the reducer.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Any other reducer failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
