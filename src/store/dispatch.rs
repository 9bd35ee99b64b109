//! The dispatch pipeline's reducer/apply stage.
//!
//! Runs inside one open storage session. Changesets are validated and
//! applied as each reducer emits them, so a later reducer's
//! transaction-scoped reads observe an earlier reducer's writes. The
//! event-log append runs last for each event and cannot be skipped by
//! a misbehaving reducer.

use tracing::debug;

use crate::changeset::ChangesetError;
use crate::collection::EVENT_LOG;
use crate::error::{ReducerError, StoreError};
use crate::event::Event;
use crate::reducer::{AggregateReducer, EventLogReducer, Reducer, ReducerContext};
use crate::storage::StorageSession;

/// Run the aggregate reducer plus the log append for every event in
/// the batch, applying changesets in emission order. Does not commit;
/// the caller owns the session's release.
pub(crate) async fn run(
    reducers: &AggregateReducer,
    log_reducer: &EventLogReducer,
    session: &mut dyn StorageSession,
    events: &[Event],
) -> Result<(), StoreError> {
    for event in events {
        for reducer in reducers.iter() {
            run_reducer(session, reducer.as_ref(), event, false).await?;
        }
        // Always last, so every committed dispatch carries its log entry.
        run_reducer(session, log_reducer, event, true).await?;
    }
    Ok(())
}

async fn run_reducer(
    session: &mut dyn StorageSession,
    reducer: &dyn Reducer,
    event: &Event,
    allow_log: bool,
) -> Result<(), StoreError> {
    let output = {
        let mut ctx = ReducerContext::new(&mut *session, reducer.collection());
        reducer
            .reduce(&mut ctx, event)
            .await
            .map_err(|e| classify(reducer.name(), e))?
    };

    for changeset in output.into_changesets() {
        changeset.validate().map_err(|e| StoreError::Reducer {
            reducer: reducer.name().to_string(),
            source: ReducerError::InvalidChangeset(e),
        })?;
        if !allow_log && changeset.collection == EVENT_LOG {
            return Err(StoreError::Reducer {
                reducer: reducer.name().to_string(),
                source: ReducerError::InvalidChangeset(ChangesetError::ReservedCollection(
                    EVENT_LOG.to_string(),
                )),
            });
        }
        debug!(
            reducer.name = %reducer.name(),
            collection = %changeset.collection,
            "Applying changeset"
        );
        session
            .apply(&changeset)
            .await
            .map_err(StoreError::Persistence)?;
    }
    Ok(())
}

/// Storage failures during a reducer's reads are persistence failures,
/// not the reducer's fault; everything else is attributed to it.
fn classify(reducer: &str, err: ReducerError) -> StoreError {
    match err {
        ReducerError::Storage(storage) => StoreError::Persistence(storage),
        other => StoreError::Reducer {
            reducer: reducer.to_string(),
            source: other,
        },
    }
}
