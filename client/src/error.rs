//! Unified error handling for the sync layer.

use livelist_engine::{EntityId, MutationKind};
use std::time::Duration;

/// Error surfaced to callers of the sync layer.
///
/// Load failures never escape as errors; they are reported through the
/// collection status and [`crate::LoadOutcome`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("mutation failed: {0}")]
    Mutation(String),

    #[error("a {kind} mutation is already pending for entity {entity_id}")]
    AlreadyPending {
        entity_id: EntityId,
        kind: MutationKind,
    },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("mutation timed out after {0:?}")]
    Timeout(Duration),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("collection is detached from its view")]
    Detached,

    #[error("engine error: {0}")]
    Engine(livelist_engine::Error),
}

impl From<livelist_engine::Error> for SyncError {
    fn from(err: livelist_engine::Error) -> Self {
        match err {
            livelist_engine::Error::AlreadyPending { entity_id, kind } => {
                SyncError::AlreadyPending { entity_id, kind }
            }
            other => SyncError::Engine(other),
        }
    }
}

/// Result type alias for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
