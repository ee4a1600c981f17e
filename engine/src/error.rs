//! Error types for the livelist engine.

use crate::{EntityId, MutationKind};
use thiserror::Error;

/// All possible errors from the livelist engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Decode errors
    #[error("missing id field '{0}'")]
    MissingId(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Mutation errors
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity already exists: {0}")]
    EntityAlreadyExists(EntityId),

    #[error("a {kind} mutation is already pending for entity {entity_id}")]
    AlreadyPending {
        entity_id: EntityId,
        kind: MutationKind,
    },

    #[error("unknown mutation: {0}")]
    UnknownMutation(u64),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::EntityNotFound(EntityId::Int(7));
        assert_eq!(err.to_string(), "entity not found: 7");

        let err = Error::AlreadyPending {
            entity_id: EntityId::from("c-1"),
            kind: MutationKind::ToggleFlag,
        };
        assert_eq!(
            err.to_string(),
            "a toggle mutation is already pending for entity c-1"
        );

        let err = Error::TypeMismatch {
            field: "likes".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'likes': expected Int, got String"
        );
    }
}
