//! Reconciliation of server-pushed change events.
//!
//! Pushed events race with local optimistic mutations: the backend may
//! broadcast a row as it was before the user's change lands. The rules:
//!
//! 1. Delete events always apply immediately. The entity is removed, every
//!    pending mutation on it is voided, and its id is tombstoned.
//! 2. Insert/Update events for an entity with a live pending mutation are
//!    buffered (latest wins) instead of applied.
//! 3. When the last live mutation for an entity settles, its buffered event
//!    is replayed, so no server change is lost for good.
//! 4. Insert/Update events for a tombstoned id are ignored.

use crate::{
    error::Result, schema::to_camel_case, Collection, Entity, EntityId, EntitySchema, Error,
    MutationKind, MutationLedger, Upsert,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Kinds that hold back pushed inserts/updates for the same entity.
pub const SUPPRESSING_KINDS: [MutationKind; 4] = [
    MutationKind::Create,
    MutationKind::Update,
    MutationKind::ToggleFlag,
    MutationKind::Delete,
];

/// Operation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A change event as delivered by the backend: raw rows before/after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn insert(row: Value) -> Self {
        Self {
            op: ChangeOp::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(old: Option<Value>, new: Value) -> Self {
        Self {
            op: ChangeOp::Update,
            new: Some(new),
            old,
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            op: ChangeOp::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// Decode into a typed event.
    ///
    /// Inserts and updates must carry a full `new` row that passes the
    /// schema. Deletes only need the id, taken from `old` (or `new`), since
    /// backends often send just the primary key for removed rows.
    pub fn decode(&self, schema: &EntitySchema) -> Result<ChangeEvent> {
        let entity = match self.op {
            ChangeOp::Insert | ChangeOp::Update => {
                let row = self
                    .new
                    .as_ref()
                    .ok_or_else(|| Error::InvalidPayload("change event without new row".into()))?;
                schema.decode(row)?
            }
            ChangeOp::Delete => {
                let row = self
                    .old
                    .as_ref()
                    .or(self.new.as_ref())
                    .and_then(Value::as_object)
                    .ok_or_else(|| Error::InvalidPayload("delete event without row".into()))?;
                decode_key_only(schema, row)?
            }
        };
        Ok(ChangeEvent {
            op: self.op,
            entity,
        })
    }
}

fn decode_key_only(schema: &EntitySchema, row: &Map<String, Value>) -> Result<Entity> {
    let id = row
        .get(&schema.id_field)
        .ok_or_else(|| Error::MissingId(schema.id_field.clone()))
        .and_then(EntityId::from_json)?;
    let attributes = row
        .iter()
        .filter(|(key, _)| **key != schema.id_field)
        .map(|(key, value)| (to_camel_case(key), value.clone()))
        .collect();
    Ok(Entity::new(id, attributes))
}

/// A decoded change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub entity: Entity,
}

impl ChangeEvent {
    pub fn insert(entity: Entity) -> Self {
        Self {
            op: ChangeOp::Insert,
            entity,
        }
    }

    pub fn update(entity: Entity) -> Self {
        Self {
            op: ChangeOp::Update,
            entity,
        }
    }

    pub fn delete(entity: Entity) -> Self {
        Self {
            op: ChangeOp::Delete,
            entity,
        }
    }
}

/// What happened to a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Inserted { position: usize },
    Replaced { position: usize },
    /// Delete applied; `position` is None when the entity was not cached
    Removed { position: Option<usize> },
    /// Held back behind a pending mutation
    Suppressed,
    /// Dropped (the entity was deleted in this session)
    Ignored,
}

/// Buffers and tombstones for one collection.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    buffered: HashMap<EntityId, ChangeEvent>,
    tombstones: HashSet<EntityId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event to the collection, honoring pending mutations.
    pub fn apply(
        &mut self,
        event: ChangeEvent,
        collection: &mut Collection,
        ledger: &mut MutationLedger,
    ) -> EventOutcome {
        let id = event.entity.id.clone();

        if event.op == ChangeOp::Delete {
            self.buffered.remove(&id);
            ledger.void_entity(&id, &SUPPRESSING_KINDS);
            self.tombstones.insert(id.clone());
            let removed = collection.remove(&id).map(|(position, _)| position);
            if removed.is_some() {
                collection.adjust_total(-1);
            }
            return EventOutcome::Removed { position: removed };
        }

        if self.tombstones.contains(&id) {
            return EventOutcome::Ignored;
        }

        if ledger.has_live(&id, &SUPPRESSING_KINDS) {
            self.buffered.insert(id, event);
            return EventOutcome::Suppressed;
        }

        match collection.upsert(event.entity) {
            Upsert::Inserted { position } => {
                collection.adjust_total(1);
                EventOutcome::Inserted { position }
            }
            Upsert::Replaced { position } => EventOutcome::Replaced { position },
        }
    }

    /// Replay the buffered event for `id` once nothing holds it back.
    pub fn replay(
        &mut self,
        id: &EntityId,
        collection: &mut Collection,
        ledger: &mut MutationLedger,
    ) -> Option<EventOutcome> {
        if ledger.has_live(id, &SUPPRESSING_KINDS) {
            return None;
        }
        let event = self.buffered.remove(id)?;
        Some(self.apply(event, collection, ledger))
    }

    /// Drop the buffered event for `id`.
    pub fn discard(&mut self, id: &EntityId) -> Option<ChangeEvent> {
        self.buffered.remove(id)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn tombstone(&mut self, id: EntityId) {
        self.tombstones.insert(id);
    }

    pub fn is_tombstoned(&self, id: &EntityId) -> bool {
        self.tombstones.contains(id)
    }

    /// Forget tombstones; a full reload is authoritative again.
    pub fn clear_tombstones(&mut self) {
        self.tombstones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType, SortOrder};
    use serde_json::json;

    fn like_entity(id: i64, likes: i64, liked: bool) -> Entity {
        Entity::from_json(id, json!({"likes": likes, "isLiked": liked})).unwrap()
    }

    fn setup() -> (Reconciler, Collection, MutationLedger) {
        let mut collection = Collection::new(10, SortOrder::NewestFirst);
        collection.upsert(like_entity(1, 5, false));
        collection.adjust_total(1);
        (Reconciler::new(), collection, MutationLedger::new())
    }

    #[test]
    fn insert_and_update_apply_when_idle() {
        let (mut reconciler, mut collection, mut ledger) = setup();

        let outcome = reconciler.apply(
            ChangeEvent::insert(like_entity(2, 0, false)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(outcome, EventOutcome::Inserted { position: 0 });
        assert_eq!(collection.total_count(), 2);

        let outcome = reconciler.apply(
            ChangeEvent::update(like_entity(1, 9, false)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(outcome, EventOutcome::Replaced { position: 1 });
        assert_eq!(
            collection.get(&EntityId::Int(1)).unwrap().get_i64("likes"),
            Some(9)
        );
    }

    #[test]
    fn update_suppressed_while_pending_then_replayed() {
        let (mut reconciler, mut collection, mut ledger) = setup();
        let id = EntityId::Int(1);
        let mutation = ledger
            .begin(id.clone(), MutationKind::ToggleFlag, None, None)
            .unwrap();

        let outcome = reconciler.apply(
            ChangeEvent::update(like_entity(1, 5, false)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(outcome, EventOutcome::Suppressed);

        // Latest buffered event wins
        reconciler.apply(
            ChangeEvent::update(like_entity(1, 7, true)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(reconciler.buffered_len(), 1);

        // Still pending: nothing to replay
        assert!(reconciler
            .replay(&id, &mut collection, &mut ledger)
            .is_none());

        ledger.finish(mutation).unwrap();
        let replayed = reconciler.replay(&id, &mut collection, &mut ledger);
        assert_eq!(replayed, Some(EventOutcome::Replaced { position: 0 }));
        assert_eq!(collection.get(&id).unwrap().get_i64("likes"), Some(7));
        assert_eq!(reconciler.buffered_len(), 0);
    }

    #[test]
    fn delete_is_never_suppressed() {
        let (mut reconciler, mut collection, mut ledger) = setup();
        let id = EntityId::Int(1);
        let mutation = ledger
            .begin(id.clone(), MutationKind::Update, None, None)
            .unwrap();
        reconciler.apply(
            ChangeEvent::update(like_entity(1, 6, false)),
            &mut collection,
            &mut ledger,
        );

        let outcome = reconciler.apply(
            ChangeEvent::delete(like_entity(1, 0, false)),
            &mut collection,
            &mut ledger,
        );

        assert_eq!(outcome, EventOutcome::Removed { position: Some(0) });
        assert!(collection.is_empty());
        assert_eq!(collection.total_count(), 0);
        assert!(ledger.get(mutation).unwrap().void);
        assert_eq!(reconciler.buffered_len(), 0);
        assert!(reconciler.is_tombstoned(&id));
    }

    #[test]
    fn tombstoned_ids_ignore_late_updates() {
        let (mut reconciler, mut collection, mut ledger) = setup();
        reconciler.apply(
            ChangeEvent::delete(like_entity(1, 0, false)),
            &mut collection,
            &mut ledger,
        );

        let outcome = reconciler.apply(
            ChangeEvent::update(like_entity(1, 5, true)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(outcome, EventOutcome::Ignored);
        assert!(collection.is_empty());

        reconciler.clear_tombstones();
        let outcome = reconciler.apply(
            ChangeEvent::insert(like_entity(1, 5, true)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(outcome, EventOutcome::Inserted { position: 0 });
    }

    #[test]
    fn delete_of_uncached_entity() {
        let (mut reconciler, mut collection, mut ledger) = setup();
        let outcome = reconciler.apply(
            ChangeEvent::delete(like_entity(42, 0, false)),
            &mut collection,
            &mut ledger,
        );
        assert_eq!(outcome, EventOutcome::Removed { position: None });
        assert_eq!(collection.total_count(), 1);
    }

    #[test]
    fn raw_change_decoding() {
        let schema = EntitySchema::new(vec![
            FieldDef::required("body", FieldType::String),
            FieldDef::optional("likes", FieldType::Int),
        ]);

        let event = RawChange::insert(json!({"id": 4, "body": "hi", "author_id": 9}))
            .decode(&schema)
            .unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.entity.get_i64("authorId"), Some(9));

        // Deletes only need the key
        let event = RawChange::delete(json!({"id": 4})).decode(&schema).unwrap();
        assert_eq!(event.op, ChangeOp::Delete);
        assert_eq!(event.entity.id, EntityId::Int(4));

        // Inserts must pass the schema
        assert!(RawChange::insert(json!({"id": 4})).decode(&schema).is_err());
        assert!(RawChange {
            op: ChangeOp::Update,
            new: None,
            old: Some(json!({"id": 4})),
        }
        .decode(&schema)
        .is_err());
    }

    #[test]
    fn raw_change_wire_shape() {
        let raw: RawChange =
            serde_json::from_str(r#"{"op": "UPDATE", "new": {"id": 1}, "old": {"id": 1}}"#)
                .unwrap();
        assert_eq!(raw.op, ChangeOp::Update);
        assert_eq!(raw.new, Some(json!({"id": 1})));
    }
}
