//! Paginated collection cache.
//!
//! A [`Collection`] is the ordered, deduplicated list behind one view (the
//! comments of one post, the ratings of one food). It tracks page bookkeeping
//! alongside the items and never holds two entities with the same id.

use crate::{Entity, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Load state of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Refreshing,
    Error,
}

/// How a fetched page is merged into the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Concatenate, skipping ids already present ("load more")
    Append,
    /// Discard existing items (page 1, pull to refresh)
    Replace,
}

/// Ordering of a collection, used to place entities that arrive by push.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SortOrder {
    /// Reverse chronological feed: new entities go to the head
    #[default]
    NewestFirst,
    /// Chronological list (comment threads): new entities go to the tail
    OldestFirst,
    /// Ordered by an attribute
    ByField { field: String, descending: bool },
}

impl SortOrder {
    fn insert_position(&self, items: &[Entity], entity: &Entity) -> usize {
        match self {
            SortOrder::NewestFirst => 0,
            SortOrder::OldestFirst => items.len(),
            SortOrder::ByField { field, descending } => {
                let key = entity.get(field);
                items
                    .iter()
                    .position(|existing| match (key, existing.get(field)) {
                        (Some(_), None) => true,
                        (None, _) => false,
                        (Some(a), Some(b)) => {
                            let ord = compare_values(a, b);
                            if *descending {
                                ord == Ordering::Greater
                            } else {
                                ord == Ordering::Less
                            }
                        }
                    })
                    .unwrap_or(items.len())
            }
        }
    }
}

/// Entities without the sort field go after those that have it.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// An entity with the same id was replaced at `position`
    Replaced { position: usize },
    /// The entity was new and inserted at `position`
    Inserted { position: usize },
}

/// A page returned by the backend, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    /// 1-based page number
    pub page: u32,
    pub mode: LoadMode,
    pub entities: Vec<Entity>,
    /// Authoritative total, when the backend reports one
    pub total: Option<u64>,
}

/// Counts from merging a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageApplied {
    /// Entities added to the collection
    pub added: usize,
    /// Entities skipped as duplicates or filtered out
    pub skipped: usize,
}

/// Ordered, deduplicated, paginated list of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub(crate) items: Vec<Entity>,
    pub(crate) page: u32,
    pub(crate) page_size: usize,
    pub(crate) has_more: bool,
    pub(crate) total_count: u64,
    pub(crate) status: LoadStatus,
    pub(crate) last_error: Option<String>,
    pub(crate) sort: SortOrder,
}

impl Collection {
    /// Create an empty collection.
    pub fn new(page_size: usize, sort: SortOrder) -> Self {
        Self {
            items: Vec::new(),
            page: 0,
            page_size: page_size.max(1),
            has_more: false,
            total_count: 0,
            status: LoadStatus::Idle,
            last_error: None,
            sort,
        }
    }

    pub fn items(&self) -> &[Entity] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get an entity by id.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.items.iter().find(|e| &e.id == id)
    }

    /// Index of an entity by id.
    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|e| &e.id == id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.position(id).is_some()
    }

    /// Ids in collection order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.items.iter().map(|e| e.id.clone()).collect()
    }

    /// Last loaded page (0 before the first load).
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Best-effort count; may drift from the server.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn status(&self) -> LoadStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sort(&self) -> &SortOrder {
        &self.sort
    }

    /// Mark a load as started.
    pub fn begin_load(&mut self, mode: LoadMode) {
        self.status = match mode {
            LoadMode::Replace if !self.items.is_empty() => LoadStatus::Refreshing,
            _ => LoadStatus::Loading,
        };
    }

    /// Mark a load as failed; items stay as they are.
    pub fn fail_load(&mut self, message: impl Into<String>) {
        self.status = LoadStatus::Error;
        self.last_error = Some(message.into());
    }

    /// Merge a fetched page.
    ///
    /// `has_more` follows the length of the page as fetched, before
    /// duplicates or entities rejected by `skip` are dropped.
    pub fn apply_page(
        &mut self,
        fetched: FetchedPage,
        skip: impl Fn(&EntityId) -> bool,
    ) -> PageApplied {
        let fetched_len = fetched.entities.len();
        let mut applied = PageApplied::default();

        let mut seen: HashSet<EntityId> = match fetched.mode {
            LoadMode::Replace => {
                self.items.clear();
                HashSet::new()
            }
            LoadMode::Append => self.items.iter().map(|e| e.id.clone()).collect(),
        };

        for entity in fetched.entities {
            if skip(&entity.id) || !seen.insert(entity.id.clone()) {
                applied.skipped += 1;
                continue;
            }
            self.items.push(entity);
            applied.added += 1;
        }

        self.page = fetched.page;
        self.has_more = fetched_len == self.page_size;
        self.total_count = match (fetched.total, fetched.mode) {
            (Some(total), _) => total,
            (None, LoadMode::Replace) => self.items.len() as u64,
            (None, LoadMode::Append) => self.total_count.max(self.items.len() as u64),
        };
        self.status = LoadStatus::Idle;
        self.last_error = None;

        applied
    }

    /// Replace an entity in place, or insert it where the sort order puts
    /// new entities.
    pub fn upsert(&mut self, entity: Entity) -> Upsert {
        if let Some(position) = self.position(&entity.id) {
            self.items[position] = entity;
            return Upsert::Replaced { position };
        }
        let position = self.sort.insert_position(&self.items, &entity);
        self.items.insert(position, entity);
        Upsert::Inserted { position }
    }

    /// Put an entity back at a known position (clamped to the current
    /// length). Replaces in place if the id is already present.
    pub fn insert_at(&mut self, position: usize, entity: Entity) -> Upsert {
        if let Some(existing) = self.position(&entity.id) {
            self.items[existing] = entity;
            return Upsert::Replaced { position: existing };
        }
        let position = position.min(self.items.len());
        self.items.insert(position, entity);
        Upsert::Inserted { position }
    }

    /// Remove an entity, returning its former position.
    pub fn remove(&mut self, id: &EntityId) -> Option<(usize, Entity)> {
        let position = self.position(id)?;
        Some((position, self.items.remove(position)))
    }

    /// Swap a placeholder entity for its confirmed counterpart.
    ///
    /// The confirmed entity takes the placeholder's slot. When the confirmed
    /// id is already present (a pushed insert beat the response) the
    /// placeholder is dropped and the existing entry is replaced in place.
    /// Returns true when the confirmed id was not in the collection before.
    pub fn replace_placeholder(&mut self, placeholder: &EntityId, confirmed: Entity) -> bool {
        if &confirmed.id != placeholder && self.contains(&confirmed.id) {
            self.remove(placeholder);
            self.upsert(confirmed);
            return false;
        }
        let was_new = !self.contains(&confirmed.id);
        match self.position(placeholder) {
            Some(position) => self.items[position] = confirmed,
            None => {
                self.upsert(confirmed);
            }
        }
        was_new
    }

    /// Shift the best-effort total.
    pub fn adjust_total(&mut self, delta: i64) {
        self.total_count = if delta.is_negative() {
            self.total_count.saturating_sub(delta.unsigned_abs())
        } else {
            self.total_count.saturating_add(delta as u64)
        };
    }
}
