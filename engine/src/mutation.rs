//! Optimistic mutations and the ledger of those still in flight.
//!
//! A mutation is applied to the cache before the backend has confirmed it.
//! The ledger remembers, per in-flight mutation, what the entity looked like
//! before so the change can be undone exactly.

use crate::{error::Result, Entity, EntityId, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of a pending mutation, unique within one ledger.
pub type MutationId = u64;

/// Kind of optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    #[serde(rename = "toggle")]
    ToggleFlag,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
            MutationKind::ToggleFlag => write!(f, "toggle"),
        }
    }
}

/// A user-initiated change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    /// Add an entity under a client-side placeholder id
    #[serde(rename_all = "camelCase")]
    Create { temp_id: EntityId, attributes: Value },
    /// Merge a partial attribute map
    Update { id: EntityId, patch: Value },
    Delete { id: EntityId },
    /// Flip a boolean flag, optionally moving a counter with it
    #[serde(rename = "toggle")]
    ToggleFlag {
        id: EntityId,
        flag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counter: Option<String>,
    },
}

impl Mutation {
    pub fn create(temp_id: impl Into<EntityId>, attributes: Value) -> Self {
        Mutation::Create {
            temp_id: temp_id.into(),
            attributes,
        }
    }

    pub fn update(id: impl Into<EntityId>, patch: Value) -> Self {
        Mutation::Update {
            id: id.into(),
            patch,
        }
    }

    pub fn delete(id: impl Into<EntityId>) -> Self {
        Mutation::Delete { id: id.into() }
    }

    pub fn toggle(id: impl Into<EntityId>, flag: impl Into<String>) -> Self {
        Mutation::ToggleFlag {
            id: id.into(),
            flag: flag.into(),
            counter: None,
        }
    }

    /// Attach a counter that follows a toggled flag (`likes` for `isLiked`).
    /// No effect on other kinds.
    pub fn with_counter(self, name: impl Into<String>) -> Self {
        match self {
            Mutation::ToggleFlag { id, flag, .. } => Mutation::ToggleFlag {
                id,
                flag,
                counter: Some(name.into()),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::ToggleFlag { .. } => MutationKind::ToggleFlag,
        }
    }

    /// The entity this mutation targets.
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Mutation::Create { temp_id, .. } => temp_id,
            Mutation::Update { id, .. } => id,
            Mutation::Delete { id } => id,
            Mutation::ToggleFlag { id, .. } => id,
        }
    }
}

/// Write sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOp::Insert => write!(f, "insert"),
            WriteOp::Update => write!(f, "update"),
            WriteOp::Delete => write!(f, "delete"),
        }
    }
}

/// The backend write that confirms a mutation, with a snake_case payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub op: WriteOp,
    pub payload: Value,
}

/// A mutation applied locally and awaiting the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: MutationId,
    pub entity_id: EntityId,
    pub kind: MutationKind,
    /// The entity as it was before the speculative change; for a create,
    /// the placeholder itself
    pub rollback_snapshot: Option<Entity>,
    /// Where the entity sat before the speculative change
    pub rollback_position: Option<usize>,
    /// Attributes the speculative change wrote; rollback restores only
    /// these. Empty means the whole entity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched: Vec<String>,
    /// Set once the backend confirmed
    pub committed: bool,
    /// Set when the entity was deleted underneath; the outcome must not
    /// touch the cache
    pub void: bool,
}

/// In-flight mutations, keyed by id and referring to entities by id only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationLedger {
    next_id: MutationId,
    pending: Vec<PendingMutation>,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutation.
    ///
    /// Rejects a second mutation of the same kind on the same entity.
    pub fn begin(
        &mut self,
        entity_id: EntityId,
        kind: MutationKind,
        rollback_snapshot: Option<Entity>,
        rollback_position: Option<usize>,
    ) -> Result<MutationId> {
        self.begin_touching(entity_id, kind, rollback_snapshot, rollback_position, Vec::new())
    }

    /// Register a mutation that writes only the `touched` attributes.
    pub fn begin_touching(
        &mut self,
        entity_id: EntityId,
        kind: MutationKind,
        rollback_snapshot: Option<Entity>,
        rollback_position: Option<usize>,
        touched: Vec<String>,
    ) -> Result<MutationId> {
        if self.is_pending(&entity_id, kind) {
            return Err(Error::AlreadyPending { entity_id, kind });
        }

        self.next_id += 1;
        let id = self.next_id;
        self.pending.push(PendingMutation {
            id,
            entity_id,
            kind,
            rollback_snapshot,
            rollback_position,
            touched,
            committed: false,
            void: false,
        });
        Ok(id)
    }

    /// Whether a mutation of `kind` is outstanding for the entity.
    pub fn is_pending(&self, entity_id: &EntityId, kind: MutationKind) -> bool {
        self.pending
            .iter()
            .any(|p| &p.entity_id == entity_id && p.kind == kind)
    }

    /// Whether a live (non-void) mutation of any of `kinds` is outstanding.
    pub fn has_live(&self, entity_id: &EntityId, kinds: &[MutationKind]) -> bool {
        self.pending
            .iter()
            .any(|p| !p.void && &p.entity_id == entity_id && kinds.contains(&p.kind))
    }

    pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
        self.pending.iter().find(|p| p.id == id)
    }

    /// Void the outstanding mutations of `kinds` for an entity.
    ///
    /// Returns how many were voided.
    pub fn void_entity(&mut self, entity_id: &EntityId, kinds: &[MutationKind]) -> usize {
        let mut voided = 0;
        for pending in self
            .pending
            .iter_mut()
            .filter(|p| !p.void && &p.entity_id == entity_id && kinds.contains(&p.kind))
        {
            pending.void = true;
            voided += 1;
        }
        voided
    }

    /// Mark a mutation as confirmed by the backend.
    pub fn mark_committed(&mut self, id: MutationId) -> Result<()> {
        let pending = self
            .pending
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(Error::UnknownMutation(id))?;
        pending.committed = true;
        Ok(())
    }

    /// Remove a mutation from the ledger.
    pub fn finish(&mut self, id: MutationId) -> Result<PendingMutation> {
        let index = self
            .pending
            .iter()
            .position(|p| p.id == id)
            .ok_or(Error::UnknownMutation(id))?;
        Ok(self.pending.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutation_accessors() {
        let toggle = Mutation::toggle(1, "isLiked").with_counter("likes");
        assert_eq!(toggle.kind(), MutationKind::ToggleFlag);
        assert_eq!(toggle.entity_id(), &EntityId::Int(1));
        assert!(matches!(
            toggle,
            Mutation::ToggleFlag { counter: Some(ref c), .. } if c == "likes"
        ));

        let delete = Mutation::delete("c-1").with_counter("ignored");
        assert_eq!(delete, Mutation::delete("c-1"));

        let create = Mutation::create("tmp-1", json!({"body": "hi"}));
        assert_eq!(create.kind(), MutationKind::Create);
        assert_eq!(create.entity_id(), &EntityId::from("tmp-1"));
    }

    #[test]
    fn serialization_toggle() {
        let toggle = Mutation::toggle(5, "isLiked").with_counter("likes");
        let json = serde_json::to_string(&toggle).unwrap();
        assert!(json.contains("\"type\":\"toggle\""));

        let parsed: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(toggle, parsed);
    }

    #[test]
    fn serialization_create() {
        let create = Mutation::create("tmp-1", json!({"body": "hi"}));
        let json = serde_json::to_value(&create).unwrap();
        assert_eq!(
            json,
            json!({"type": "create", "tempId": "tmp-1", "attributes": {"body": "hi"}})
        );
    }

    #[test]
    fn ledger_rejects_same_kind() {
        let mut ledger = MutationLedger::new();
        let id = EntityId::Int(1);

        ledger
            .begin(id.clone(), MutationKind::ToggleFlag, None, None)
            .unwrap();
        let err = ledger
            .begin(id.clone(), MutationKind::ToggleFlag, None, None)
            .unwrap_err();
        assert_eq!(
            err,
            Error::AlreadyPending {
                entity_id: id.clone(),
                kind: MutationKind::ToggleFlag
            }
        );

        // A different kind on the same entity is allowed
        assert!(ledger.begin(id, MutationKind::Update, None, None).is_ok());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn ledger_finish_frees_slot() {
        let mut ledger = MutationLedger::new();
        let first = ledger
            .begin(EntityId::Int(1), MutationKind::Update, None, None)
            .unwrap();
        ledger.mark_committed(first).unwrap();

        let finished = ledger.finish(first).unwrap();
        assert!(finished.committed);
        assert!(ledger.is_empty());
        assert_eq!(ledger.finish(first), Err(Error::UnknownMutation(first)));

        let second = ledger
            .begin(EntityId::Int(1), MutationKind::Update, None, None)
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn void_entity_hides_from_live_checks() {
        let mut ledger = MutationLedger::new();
        let id = EntityId::Int(3);
        let update = ledger
            .begin(id.clone(), MutationKind::Update, None, None)
            .unwrap();
        ledger
            .begin(EntityId::Int(4), MutationKind::Update, None, None)
            .unwrap();

        assert!(ledger.has_live(&id, &[MutationKind::Update, MutationKind::ToggleFlag]));
        assert_eq!(
            ledger.void_entity(&id, &[MutationKind::Update, MutationKind::ToggleFlag]),
            1
        );
        assert!(!ledger.has_live(&id, &[MutationKind::Update, MutationKind::ToggleFlag]));
        assert!(ledger.get(update).unwrap().void);
        // Still occupies the slot until finished
        assert!(ledger.is_pending(&id, MutationKind::Update));
        assert!(ledger.has_live(&EntityId::Int(4), &[MutationKind::Update]));
    }
}
