//! Shared collections.
//!
//! Views asking for the same resource and filter get the same
//! [`LiveCollection`], so a like toggled on one screen shows on the other.
//! The registry holds collections weakly; they live as long as some view does.

use crate::collection::{CollectionOptions, LiveCollection};
use crate::resource::{Filter, ResourceClient};
use crate::subscription::SubscriptionKey;
use dashmap::DashMap;
use livelist_engine::EntitySchema;
use std::sync::{Arc, Weak};

pub struct CollectionRegistry {
    client: Arc<dyn ResourceClient>,
    defaults: CollectionOptions,
    collections: DashMap<SubscriptionKey, Weak<LiveCollection>>,
}

impl CollectionRegistry {
    pub fn new(client: Arc<dyn ResourceClient>, defaults: CollectionOptions) -> Self {
        Self {
            client,
            defaults,
            collections: DashMap::new(),
        }
    }

    pub fn new_shared(client: Arc<dyn ResourceClient>, defaults: CollectionOptions) -> Arc<Self> {
        Arc::new(Self::new(client, defaults))
    }

    /// The live collection for `resource` + `filter`, created with the
    /// default options when none is alive.
    pub fn collection(
        &self,
        resource: &str,
        filter: &Filter,
        schema: EntitySchema,
    ) -> Arc<LiveCollection> {
        self.collection_with(resource, filter, schema, self.defaults.clone())
    }

    /// Like [`CollectionRegistry::collection`]. Options and schema only apply
    /// when a new collection is created.
    pub fn collection_with(
        &self,
        resource: &str,
        filter: &Filter,
        schema: EntitySchema,
        options: CollectionOptions,
    ) -> Arc<LiveCollection> {
        let key = SubscriptionKey::new(resource, filter);
        let mut slot = self.collections.entry(key).or_default();
        // A detached collection belongs to a closed view; never hand it out again
        if let Some(existing) = slot.upgrade().filter(|c| !c.is_detached()) {
            tracing::trace!(resource = %resource, filter = %filter, "Reusing live collection");
            return existing;
        }

        let created = LiveCollection::new(
            Arc::clone(&self.client),
            resource,
            filter.clone(),
            schema,
            options,
        );
        *slot = Arc::downgrade(&created);
        tracing::debug!(resource = %resource, filter = %filter, "Created live collection");
        created
    }

    /// The collection for a key, if one is alive.
    pub fn get(&self, resource: &str, filter: &Filter) -> Option<Arc<LiveCollection>> {
        self.collections
            .get(&SubscriptionKey::new(resource, filter))
            .and_then(|slot| slot.upgrade())
            .filter(|c| !c.is_detached())
    }

    /// Number of collections still alive and attached.
    pub fn live_count(&self) -> usize {
        self.collections
            .iter()
            .filter(|slot| {
                slot.value()
                    .upgrade()
                    .is_some_and(|c| !c.is_detached())
            })
            .count()
    }

    /// Forget entries whose collections were dropped or detached.
    pub fn prune(&self) -> usize {
        let before = self.collections.len();
        self.collections
            .retain(|_, slot| slot.upgrade().is_some_and(|c| !c.is_detached()));
        before - self.collections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryResource;
    use livelist_engine::{FieldDef, FieldType};

    fn schema() -> EntitySchema {
        EntitySchema::new(vec![FieldDef::required("body", FieldType::String)])
    }

    #[test]
    fn same_key_shares_collection() {
        let registry = CollectionRegistry::new(MemoryResource::new_shared(), CollectionOptions::default());
        let filter = Filter::all().eq("post_id", 1);

        let a = registry.collection("comments", &filter, schema());
        let b = registry.collection("comments", &filter, schema());
        let other = registry.collection("comments", &Filter::all().eq("post_id", 2), schema());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn dropped_collections_are_recreated() {
        let registry = CollectionRegistry::new(MemoryResource::new_shared(), CollectionOptions::default());
        let filter = Filter::all();

        let first = registry.collection("comments", &filter, schema());
        let weak = Arc::downgrade(&first);
        drop(first);
        assert!(registry.get("comments", &filter).is_none());

        let second = registry.collection("comments", &filter, schema());
        assert!(weak.upgrade().is_none());
        assert_eq!(registry.live_count(), 1);
        drop(second);

        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn detached_collections_are_replaced() {
        let registry = CollectionRegistry::new(MemoryResource::new_shared(), CollectionOptions::default());
        let filter = Filter::all();

        let stale = registry.collection("comments", &filter, schema());
        stale.detach();
        assert!(registry.get("comments", &filter).is_none());

        let fresh = registry.collection("comments", &filter, schema());
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(!fresh.is_detached());
        assert_eq!(registry.live_count(), 1);
    }
}
