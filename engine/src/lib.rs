//! # Livelist Engine
//!
//! Deterministic state for live, optimistically-mutated collections.
//!
//! This crate holds the pure part of the livelist sync layer: the paginated
//! collection cache, the ledger of optimistic mutations and the reconciler
//! that merges server-pushed change events into both. It has no knowledge of
//! the network; the `livelist-client` crate drives it.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of sockets, backends or timers
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Testable**: Pure logic, no mocks needed
//! - **Fail closed**: Loosely typed rows are decoded at the boundary
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! An [`Entity`] is an id plus camelCase attributes. Backend rows
//! (snake_case JSON) are turned into entities by an [`EntitySchema`], which
//! checks declared field types and rounds percentages to one decimal.
//!
//! ### Collections
//!
//! A [`Collection`] is an ordered, deduplicated list with page bookkeeping.
//! `hasMore` follows the length of the most recent page.
//!
//! ### Optimistic Mutations
//!
//! A [`Mutation`] is applied to the cache before the backend confirms it.
//! The [`MutationLedger`] keeps a rollback snapshot per in-flight mutation so
//! a rejection restores the entity exactly.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] applies pushed [`ChangeEvent`]s:
//! - Deletes always apply and tombstone the id
//! - Inserts/updates for an entity with a pending mutation are buffered and
//!   replayed once the mutation settles
//!
//! ## Quick Start
//!
//! ```rust
//! use livelist_engine::{
//!     EntityId, EntitySchema, FetchedPage, FieldDef, FieldType, LoadMode, Mutation,
//!     SortOrder, SyncStore,
//! };
//! use serde_json::json;
//!
//! // 1. Describe the rows
//! let schema = EntitySchema::new(vec![
//!     FieldDef::required("body", FieldType::String),
//!     FieldDef::optional("likes", FieldType::Int),
//!     FieldDef::optional("isLiked", FieldType::Bool),
//! ]);
//!
//! // 2. Load a page
//! let mut store = SyncStore::new(schema, 20, SortOrder::OldestFirst);
//! let rows = [json!({"id": 1, "body": "hi", "likes": 5, "is_liked": false})];
//! let entities = store.decode_rows(&rows).unwrap();
//! store.apply_page(FetchedPage { page: 1, mode: LoadMode::Replace, entities, total: None });
//!
//! // 3. Toggle a like optimistically
//! let toggle = Mutation::toggle(1, "isLiked").with_counter("likes");
//! let ticket = store.begin_mutation(&toggle).unwrap();
//! assert_eq!(store.get(&EntityId::Int(1)).unwrap().get_i64("likes"), Some(6));
//!
//! // 4. The backend said no
//! store.rollback_mutation(ticket.id).unwrap();
//! assert_eq!(store.get(&EntityId::Int(1)).unwrap().get_i64("likes"), Some(5));
//! ```
//!
//! ## Persistence
//!
//! Use [`SyncStore::export_snapshot`] and [`SyncStore::import_snapshot`] with
//! [`CollectionSnapshot`] to warm-start a view.

pub mod collection;
pub mod entity;
pub mod error;
pub mod mutation;
pub mod reconcile;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use collection::{
    Collection, FetchedPage, LoadMode, LoadStatus, PageApplied, SortOrder, Upsert,
};
pub use entity::{Entity, EntityId};
pub use error::Error;
pub use mutation::{
    Mutation, MutationId, MutationKind, MutationLedger, PendingMutation, WriteOp, WriteRequest,
};
pub use reconcile::{ChangeEvent, ChangeOp, EventOutcome, RawChange, Reconciler};
pub use schema::{EntitySchema, FieldDef, FieldType};
pub use snapshot::{CollectionSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{MutationTicket, Settled, SyncStore};
