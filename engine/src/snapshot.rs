//! Snapshot types for persisting and restoring a collection.
//!
//! A snapshot holds the confirmed items and page bookkeeping of one
//! collection, so a view can warm-start from disk before the first fetch
//! lands. Load status and errors are transient and not persisted.

use crate::{error::Result, Collection, Entity, Error, LoadStatus, SortOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    pub items: Vec<Entity>,
    /// Last page loaded (1-based, 0 when nothing was loaded)
    pub page: u32,
    pub page_size: usize,
    pub has_more: bool,
    pub total_count: u64,
    #[serde(default)]
    pub sort: SortOrder,
}

impl CollectionSnapshot {
    /// Capture a collection.
    pub fn from_collection(collection: &Collection) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            items: collection.items.clone(),
            page: collection.page,
            page_size: collection.page_size,
            has_more: collection.has_more,
            total_count: collection.total_count,
            sort: collection.sort.clone(),
        }
    }

    /// Rebuild an idle collection from the snapshot.
    pub fn into_collection(self) -> Collection {
        let mut collection = Collection::new(self.page_size, self.sort);
        collection.items = self.items;
        collection.page = self.page;
        collection.has_more = self.has_more;
        collection.total_count = self.total_count;
        collection.status = LoadStatus::Idle;
        collection
    }

    /// Check the format version and id uniqueness.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let mut seen = HashSet::with_capacity(self.items.len());
        for entity in &self.items {
            if !seen.insert(&entity.id) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate entity id: {}",
                    entity.id
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchedPage, LoadMode};
    use serde_json::json;

    fn loaded_collection() -> Collection {
        let mut collection = Collection::new(2, SortOrder::OldestFirst);
        collection.apply_page(
            FetchedPage {
                page: 1,
                mode: LoadMode::Replace,
                entities: vec![
                    Entity::from_json(1, json!({"body": "a"})).unwrap(),
                    Entity::from_json(2, json!({"body": "b"})).unwrap(),
                ],
                total: Some(7),
            },
            |_| false,
        );
        collection
    }

    #[test]
    fn capture_and_restore() {
        let collection = loaded_collection();
        let snapshot = CollectionSnapshot::from_collection(&collection);

        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.items.len(), 2);
        assert!(snapshot.has_more);
        assert_eq!(snapshot.total_count, 7);

        let restored = snapshot.into_collection();
        assert_eq!(restored, collection);
    }

    #[test]
    fn json_roundtrip() {
        let snapshot = CollectionSnapshot::from_collection(&loaded_collection());
        let json = snapshot.to_json().unwrap();
        assert_eq!(CollectionSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn reject_duplicate_ids() {
        let mut snapshot = CollectionSnapshot::from_collection(&loaded_collection());
        let dup = snapshot.items[0].clone();
        snapshot.items.push(dup);

        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_other_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "items": [],
            "page": 0,
            "pageSize": 20,
            "hasMore": false,
            "totalCount": 0
        }"#;

        let result = CollectionSnapshot::from_json(json);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }
}
