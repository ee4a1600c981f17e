//! Store - the per-collection state container.
//!
//! A [`SyncStore`] owns one [`Collection`] together with the ledger of
//! optimistic mutations against it and the reconciler for pushed events.
//! Every state transition of the sync layer goes through here, so the whole
//! layer can be exercised without IO.

use crate::{
    error::Result, reconcile::SUPPRESSING_KINDS, ChangeEvent, Collection, CollectionSnapshot,
    Entity, EntityId, EntitySchema, Error, EventOutcome, FetchedPage, LoadMode, Mutation,
    MutationId, MutationKind, MutationLedger, PageApplied, RawChange, Reconciler, SortOrder,
    Upsert, WriteOp, WriteRequest,
};
use serde_json::{Map, Value};

/// A mutation that has been applied locally and must now be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationTicket {
    pub id: MutationId,
    pub kind: MutationKind,
    pub entity_id: EntityId,
    /// Mutations voided by this one (in-flight updates of a deleted entity)
    pub voided: usize,
    pub request: WriteRequest,
}

/// Outcome of settling a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub id: MutationId,
    pub kind: MutationKind,
    pub entity_id: EntityId,
    /// False when the mutation had been voided and left the cache alone
    pub applied: bool,
    /// Buffered events replayed once the mutation cleared
    pub replayed: Vec<EventOutcome>,
}

fn as_object(value: &Value, what: &str) -> Result<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidPayload(format!("{} must be an object", what)))
}

/// State of one live collection.
#[derive(Debug, Clone)]
pub struct SyncStore {
    schema: EntitySchema,
    collection: Collection,
    ledger: MutationLedger,
    reconciler: Reconciler,
}

impl SyncStore {
    /// Create an empty store.
    pub fn new(schema: EntitySchema, page_size: usize, sort: SortOrder) -> Self {
        Self {
            schema,
            collection: Collection::new(page_size, sort),
            ledger: MutationLedger::new(),
            reconciler: Reconciler::new(),
        }
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn ledger(&self) -> &MutationLedger {
        &self.ledger
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Get a cached entity.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.collection.get(id)
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.len()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    pub fn begin_load(&mut self, mode: LoadMode) {
        self.collection.begin_load(mode);
    }

    /// Decode backend rows; the first malformed row fails the whole page.
    pub fn decode_rows(&self, rows: &[Value]) -> Result<Vec<Entity>> {
        rows.iter().map(|row| self.schema.decode(row)).collect()
    }

    /// Merge a fetched page.
    ///
    /// Entities with a live local delete are held out. Appended pages also
    /// drop ids deleted earlier in the session; a replace is a fresh start
    /// and clears those tombstones.
    pub fn apply_page(&mut self, page: FetchedPage) -> PageApplied {
        if page.mode == LoadMode::Replace {
            self.reconciler.clear_tombstones();
        }
        let ledger = &self.ledger;
        let reconciler = &self.reconciler;
        let applied = self.collection.apply_page(page, |id| {
            ledger.has_live(id, &[MutationKind::Delete]) || reconciler.is_tombstoned(id)
        });

        // Placeholders of in-flight creates are not on the server yet
        let placeholders: Vec<Entity> = self
            .ledger
            .iter()
            .filter(|p| p.kind == MutationKind::Create && !p.void)
            .filter_map(|p| p.rollback_snapshot.clone())
            .collect();
        for placeholder in placeholders {
            if !self.collection.contains(&placeholder.id) {
                self.collection.upsert(placeholder);
            }
        }

        applied
    }

    pub fn fail_load(&mut self, message: impl Into<String>) {
        self.collection.fail_load(message);
    }

    // ------------------------------------------------------------------
    // Direct cache access
    // ------------------------------------------------------------------

    /// Replace in place or insert by sort order.
    pub fn upsert(&mut self, entity: Entity) -> Upsert {
        self.collection.upsert(entity)
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        self.collection.remove(id).map(|(_, entity)| entity)
    }

    // ------------------------------------------------------------------
    // Optimistic mutations
    // ------------------------------------------------------------------

    /// Apply a mutation speculatively and register it as pending.
    ///
    /// Nothing is changed when an error is returned.
    pub fn begin_mutation(&mut self, mutation: &Mutation) -> Result<MutationTicket> {
        let kind = mutation.kind();
        let entity_id = mutation.entity_id().clone();

        if self.ledger.is_pending(&entity_id, kind) {
            return Err(Error::AlreadyPending { entity_id, kind });
        }
        if kind != MutationKind::Create
            && self.ledger.has_live(&entity_id, &[MutationKind::Create])
        {
            // The placeholder has no server row to act on yet
            return Err(Error::AlreadyPending {
                entity_id,
                kind: MutationKind::Create,
            });
        }

        match mutation {
            Mutation::Create { temp_id, attributes } => {
                if self.collection.contains(temp_id) {
                    return Err(Error::EntityAlreadyExists(temp_id.clone()));
                }
                let attributes = as_object(attributes, "attributes")?;
                let entity = self.schema.prepare(temp_id.clone(), &attributes)?;
                let request = WriteRequest {
                    op: WriteOp::Insert,
                    payload: self.schema.encode(None, &entity.attributes),
                };
                // The placeholder itself is kept so a reload does not drop it
                let id = self
                    .ledger
                    .begin(temp_id.clone(), kind, Some(entity.clone()), None)?;
                self.collection.upsert(entity);
                Ok(MutationTicket {
                    id,
                    kind,
                    entity_id,
                    voided: 0,
                    request,
                })
            }

            Mutation::Update { id: target, patch } => {
                let patch = self.schema.normalize_patch(&as_object(patch, "patch")?)?;
                let (position, snapshot) = self.locate(target)?;
                let request = WriteRequest {
                    op: WriteOp::Update,
                    payload: self.schema.encode(Some(target), &patch),
                };
                let touched = patch.keys().cloned().collect();
                let id = self.ledger.begin_touching(
                    target.clone(),
                    kind,
                    Some(snapshot),
                    Some(position),
                    touched,
                )?;
                self.collection.items[position].merge(&patch);
                Ok(MutationTicket {
                    id,
                    kind,
                    entity_id,
                    voided: 0,
                    request,
                })
            }

            Mutation::Delete { id: target } => {
                let (position, snapshot) = self.locate(target)?;
                let request = WriteRequest {
                    op: WriteOp::Delete,
                    payload: self.schema.encode(Some(target), &Map::new()),
                };
                let id = self
                    .ledger
                    .begin(target.clone(), kind, Some(snapshot), Some(position))?;
                // Delete wins over in-flight edits of the same entity
                let voided = self
                    .ledger
                    .void_entity(target, &[MutationKind::Update, MutationKind::ToggleFlag]);
                self.collection.remove(target);
                Ok(MutationTicket {
                    id,
                    kind,
                    entity_id,
                    voided,
                    request,
                })
            }

            Mutation::ToggleFlag {
                id: target,
                flag,
                counter,
            } => {
                let (position, snapshot) = self.locate(target)?;
                let current = read_flag(&snapshot, flag)?;
                let next = !current;
                let count = match counter {
                    Some(name) => Some((name, read_counter(&snapshot, name)?)),
                    None => None,
                };

                let mut patch = Map::new();
                patch.insert(flag.clone(), Value::Bool(next));
                let request = WriteRequest {
                    op: WriteOp::Update,
                    payload: self.schema.encode(Some(target), &patch),
                };
                let mut touched = vec![flag.clone()];
                touched.extend(counter.iter().cloned());
                let id = self.ledger.begin_touching(
                    target.clone(),
                    kind,
                    Some(snapshot),
                    Some(position),
                    touched,
                )?;

                let entity = &mut self.collection.items[position];
                entity.set(flag.clone(), Value::Bool(next));
                if let Some((name, value)) = count {
                    let moved = if next {
                        value.saturating_add(1)
                    } else {
                        value.saturating_sub(1).max(0)
                    };
                    entity.set(name.clone(), Value::from(moved));
                }
                Ok(MutationTicket {
                    id,
                    kind,
                    entity_id,
                    voided: 0,
                    request,
                })
            }
        }
    }

    fn locate(&self, id: &EntityId) -> Result<(usize, Entity)> {
        let position = self
            .collection
            .position(id)
            .ok_or_else(|| Error::EntityNotFound(id.clone()))?;
        Ok((position, self.collection.items[position].clone()))
    }

    /// Settle a mutation the backend accepted.
    ///
    /// `authoritative` is the row returned by the backend, already decoded.
    /// It overwrites the speculative guess; for creates it replaces the
    /// placeholder.
    pub fn commit_mutation(
        &mut self,
        id: MutationId,
        authoritative: Option<Entity>,
    ) -> Result<Settled> {
        self.ledger.mark_committed(id)?;
        let pending = self.ledger.finish(id)?;
        let applied = !pending.void;
        let mut touched = vec![pending.entity_id.clone()];

        if applied {
            match pending.kind {
                MutationKind::Create => match authoritative {
                    Some(confirmed) => {
                        touched.push(confirmed.id.clone());
                        if self
                            .collection
                            .replace_placeholder(&pending.entity_id, confirmed)
                        {
                            self.collection.adjust_total(1);
                        }
                    }
                    None => {
                        if self.collection.contains(&pending.entity_id) {
                            self.collection.adjust_total(1);
                        }
                    }
                },
                MutationKind::Update | MutationKind::ToggleFlag => {
                    if let Some(mut confirmed) = authoritative {
                        // Never resurrect an entity removed meanwhile
                        if let Some(current) = self.collection.get(&confirmed.id) {
                            // Other in-flight edits stay visible until they settle
                            let confirmed_id = confirmed.id.clone();
                            for other in self.ledger.iter().filter(|p| {
                                !p.void && p.entity_id == confirmed_id && !p.touched.is_empty()
                            }) {
                                confirmed.restore(current, &other.touched);
                            }
                            self.collection.upsert(confirmed);
                        }
                    }
                }
                MutationKind::Delete => {
                    self.reconciler.discard(&pending.entity_id);
                    self.reconciler.tombstone(pending.entity_id.clone());
                    self.collection.adjust_total(-1);
                }
            }
        }

        let replayed = self.replay(&touched);
        Ok(Settled {
            id,
            kind: pending.kind,
            entity_id: pending.entity_id,
            applied,
            replayed,
        })
    }

    /// Undo a mutation the backend rejected, restoring the snapshot exactly.
    pub fn rollback_mutation(&mut self, id: MutationId) -> Result<Settled> {
        let pending = self.ledger.finish(id)?;
        let applied = !pending.void;

        if applied {
            match pending.kind {
                MutationKind::Create => {
                    self.collection.remove(&pending.entity_id);
                }
                MutationKind::Update | MutationKind::ToggleFlag => {
                    if let Some(snapshot) = &pending.rollback_snapshot {
                        if let Some(position) = self.collection.position(&snapshot.id) {
                            self.collection.items[position].restore(snapshot, &pending.touched);
                        }
                    }
                }
                MutationKind::Delete => {
                    if let Some(snapshot) = pending.rollback_snapshot {
                        if !self.reconciler.is_tombstoned(&snapshot.id) {
                            let position = pending.rollback_position.unwrap_or(0);
                            self.collection.insert_at(position, snapshot);
                        }
                    }
                }
            }
        }

        let replayed = self.replay(std::slice::from_ref(&pending.entity_id));
        Ok(Settled {
            id,
            kind: pending.kind,
            entity_id: pending.entity_id,
            applied,
            replayed,
        })
    }

    fn replay(&mut self, ids: &[EntityId]) -> Vec<EventOutcome> {
        ids.iter()
            .filter_map(|id| {
                self.reconciler
                    .replay(id, &mut self.collection, &mut self.ledger)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Pushed events
    // ------------------------------------------------------------------

    /// Decode a raw change with this store's schema.
    pub fn decode_change(&self, raw: &RawChange) -> Result<ChangeEvent> {
        raw.decode(&self.schema)
    }

    /// Apply a pushed change, honoring pending mutations.
    pub fn apply_event(&mut self, event: ChangeEvent) -> EventOutcome {
        self.reconciler
            .apply(event, &mut self.collection, &mut self.ledger)
    }

    /// Whether a pushed insert/update for `id` would be held back.
    pub fn is_suppressed(&self, id: &EntityId) -> bool {
        self.ledger.has_live(id, &SUPPRESSING_KINDS)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// The collection as confirmed by the backend: pending speculative
    /// changes are undone on a copy, newest first.
    pub fn confirmed_collection(&self) -> Collection {
        let mut confirmed = self.collection.clone();
        let mut pending: Vec<_> = self.ledger.iter().filter(|p| !p.void).collect();
        pending.sort_by(|a, b| b.id.cmp(&a.id));

        for p in pending {
            match p.kind {
                MutationKind::Create => {
                    confirmed.remove(&p.entity_id);
                }
                MutationKind::Update | MutationKind::ToggleFlag => {
                    if let Some(snapshot) = &p.rollback_snapshot {
                        if let Some(position) = confirmed.position(&snapshot.id) {
                            confirmed.items[position].restore(snapshot, &p.touched);
                        }
                    }
                }
                MutationKind::Delete => {
                    if let Some(snapshot) = &p.rollback_snapshot {
                        confirmed.insert_at(p.rollback_position.unwrap_or(0), snapshot.clone());
                    }
                }
            }
        }
        confirmed
    }

    /// Export the confirmed state for a warm start.
    pub fn export_snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot::from_collection(&self.confirmed_collection())
    }

    /// Replace the collection with a snapshot.
    ///
    /// Refused while mutations are in flight, since their rollback snapshots
    /// refer to the current items.
    pub fn import_snapshot(&mut self, snapshot: CollectionSnapshot) -> Result<()> {
        if !self.ledger.is_empty() {
            return Err(Error::InvalidSnapshot(format!(
                "{} mutations pending",
                self.ledger.len()
            )));
        }
        snapshot.validate()?;
        self.collection = snapshot.into_collection();
        self.reconciler = Reconciler::new();
        Ok(())
    }
}

fn read_flag(entity: &Entity, flag: &str) -> Result<bool> {
    match entity.get(flag) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(Error::TypeMismatch {
            field: flag.to_string(),
            expected: "Bool".into(),
            got: other.to_string(),
        }),
    }
}

fn read_counter(entity: &Entity, counter: &str) -> Result<i64> {
    match entity.get(counter) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value.as_i64().ok_or_else(|| Error::TypeMismatch {
            field: counter.to_string(),
            expected: "Int".into(),
            got: value.to_string(),
        }),
    }
}
