//! Live collections.
//!
//! A [`LiveCollection`] drives one [`SyncStore`] against a backend: it loads
//! pages, performs optimistic mutations and takes in pushed change events.
//! The store sits behind a mutex that is never held across an await.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::resource::{Filter, OrderBy, Query, ResourceClient};
use crate::subscription::{Handler, SubscriptionEvent, SubscriptionHandle, SubscriptionManager};
use livelist_engine::{
    Collection, CollectionSnapshot, Entity, EntityId, EntitySchema, EventOutcome, FetchedPage,
    LoadMode, LoadStatus, Mutation, MutationId, MutationKind, MutationTicket, PageApplied,
    RawChange, SortOrder, SyncStore,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Per-collection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOptions {
    pub page_size: usize,
    pub sort: SortOrder,
    /// Deadline raced against remote mutations
    pub mutation_timeout: Option<Duration>,
    /// Column used for chronological ordering
    pub time_column: String,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for CollectionOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            sort: SortOrder::default(),
            mutation_timeout: config.mutation_timeout,
            time_column: "created_at".to_string(),
        }
    }
}

impl CollectionOptions {
    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = Some(timeout);
        self
    }
}

/// Result of a load. Failures are reported here and in the collection
/// status, never as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(PageApplied),
    Failed(SyncError),
    /// A newer refresh started while this page was in flight
    Superseded,
    /// The collection was torn down
    Detached,
}

/// A collection kept in sync with one backend resource.
pub struct LiveCollection {
    resource: String,
    filter: Filter,
    client: Arc<dyn ResourceClient>,
    options: CollectionOptions,
    store: Mutex<SyncStore>,
    version: watch::Sender<u64>,
    generation: AtomicU64,
    views: AtomicUsize,
    detached: AtomicBool,
}

impl LiveCollection {
    /// Create an empty collection.
    pub fn new(
        client: Arc<dyn ResourceClient>,
        resource: impl Into<String>,
        filter: Filter,
        schema: EntitySchema,
        options: CollectionOptions,
    ) -> Arc<Self> {
        let store = SyncStore::new(schema, options.page_size, options.sort.clone());
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            resource: resource.into(),
            filter,
            client,
            options,
            store: Mutex::new(store),
            version,
            generation: AtomicU64::new(0),
            views: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SyncStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    /// Receive a new version number after every change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Read the store under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&SyncStore) -> R) -> R {
        f(&self.lock())
    }

    /// Copy of the collection state.
    pub fn snapshot(&self) -> Collection {
        self.read(|store| store.collection().clone())
    }

    pub fn items(&self) -> Vec<Entity> {
        self.read(|store| store.collection().items().to_vec())
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.read(|store| store.collection().ids())
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.read(|store| store.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.read(|store| store.collection().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> LoadStatus {
        self.read(|store| store.collection().status())
    }

    pub fn has_more(&self) -> bool {
        self.read(|store| store.collection().has_more())
    }

    pub fn total_count(&self) -> u64 {
        self.read(|store| store.collection().total_count())
    }

    pub fn pending_count(&self) -> usize {
        self.read(|store| store.pending_count())
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Number of view scopes holding this collection.
    pub fn view_count(&self) -> usize {
        self.views.load(Ordering::SeqCst)
    }

    pub(crate) fn retain_view(&self) {
        self.views.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when the last view let go.
    pub(crate) fn release_view(&self) -> bool {
        self.views
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }

    /// Stop applying anything to this collection. In-flight loads and
    /// mutations complete without touching it.
    pub fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            tracing::debug!(resource = %self.resource, filter = %self.filter, "Collection detached");
        }
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Fetch one page and merge it.
    pub async fn load(&self, page: u32, mode: LoadMode) -> LoadOutcome {
        if self.is_detached() {
            return LoadOutcome::Detached;
        }

        let generation = match mode {
            LoadMode::Replace => self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            LoadMode::Append => self.generation.load(Ordering::SeqCst),
        };
        let query = {
            let mut store = self.lock();
            store.begin_load(mode);
            let collection = store.collection();
            Query::page(page, collection.page_size()).ordered(OrderBy::for_sort(
                collection.sort(),
                &self.options.time_column,
            ))
        };
        self.notify();

        let result = self.client.query(&self.resource, &self.filter, &query).await;

        if self.is_detached() {
            return LoadOutcome::Detached;
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(resource = %self.resource, page, "Discarding superseded page");
            return LoadOutcome::Superseded;
        }

        let outcome = {
            let mut store = self.lock();
            let fetched = result
                .map_err(|e| SyncError::Fetch(e.to_string()))
                .and_then(|fetched| {
                    store
                        .decode_rows(&fetched.rows)
                        .map(|entities| (entities, fetched.total))
                        .map_err(|e| SyncError::Fetch(e.to_string()))
                });

            match fetched {
                Ok((entities, total)) => {
                    let applied = store.apply_page(FetchedPage {
                        page,
                        mode,
                        entities,
                        total,
                    });
                    tracing::info!(
                        resource = %self.resource,
                        filter = %self.filter,
                        page,
                        added = applied.added,
                        skipped = applied.skipped,
                        has_more = store.collection().has_more(),
                        "Page loaded"
                    );
                    LoadOutcome::Loaded(applied)
                }
                Err(err) => {
                    store.fail_load(err.to_string());
                    tracing::warn!(resource = %self.resource, filter = %self.filter, page, error = %err, "Page load failed");
                    LoadOutcome::Failed(err)
                }
            }
        };
        self.notify();
        outcome
    }

    /// Reload the first page, replacing everything.
    pub async fn refresh(&self) -> LoadOutcome {
        self.load(1, LoadMode::Replace).await
    }

    /// Append the next page.
    pub async fn load_more(&self) -> LoadOutcome {
        let next = self.read(|store| store.collection().page()) + 1;
        self.load(next, LoadMode::Append).await
    }

    /// Put an entity into the cache directly, bypassing the backend.
    pub fn upsert(&self, entity: Entity) {
        if self.is_detached() {
            return;
        }
        self.lock().upsert(entity);
        self.notify();
    }

    /// Drop an entity from the cache directly, bypassing the backend.
    pub fn remove(&self, id: &EntityId) -> Option<Entity> {
        if self.is_detached() {
            return None;
        }
        let removed = self.lock().remove(id);
        self.notify();
        removed
    }

    // ------------------------------------------------------------------
    // Optimistic mutations
    // ------------------------------------------------------------------

    /// Apply a mutation locally, send it, then commit or roll back.
    ///
    /// The speculative change is visible as soon as this is polled. On error
    /// the collection has already been restored.
    pub async fn perform(&self, mutation: Mutation) -> Result<()> {
        if self.is_detached() {
            return Err(SyncError::Detached);
        }
        if self.client.session().is_none() {
            tracing::warn!(resource = %self.resource, kind = %mutation.kind(), "Mutation without a session");
            return Err(SyncError::NotAuthenticated);
        }

        let ticket = self.lock().begin_mutation(&mutation).map_err(|e| {
            tracing::warn!(
                resource = %self.resource,
                entity_id = %mutation.entity_id(),
                kind = %mutation.kind(),
                error = %e,
                "Mutation rejected locally"
            );
            SyncError::from(e)
        })?;
        self.notify();
        tracing::debug!(
            resource = %self.resource,
            entity_id = %ticket.entity_id,
            kind = %ticket.kind,
            voided = ticket.voided,
            "Speculative change applied"
        );

        let mut guard = PendingGuard {
            collection: self,
            ticket: Some(ticket.id),
        };

        let call = self.client.mutate(
            &self.resource,
            ticket.request.op,
            ticket.request.payload.clone(),
        );
        let result = match self.options.mutation_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result.map_err(|e| SyncError::Mutation(e.to_string())),
                Err(_) => Err(SyncError::Timeout(limit)),
            },
            None => call.await.map_err(|e| SyncError::Mutation(e.to_string())),
        };
        guard.ticket = None;

        match result {
            Ok(row) => {
                self.commit(&ticket, row);
                Ok(())
            }
            Err(err) => {
                self.rollback(&ticket, &err);
                Err(err)
            }
        }
    }

    fn commit(&self, ticket: &MutationTicket, row: Option<Value>) {
        if self.is_detached() {
            return;
        }

        let settled = {
            let mut store = self.lock();
            // A delete echoes the removed row, which is not authoritative state
            let authoritative = match (ticket.kind, row) {
                (MutationKind::Delete, _) | (_, None) => None,
                (_, Some(row)) => match store.schema().decode(&row) {
                    Ok(entity) => Some(entity),
                    Err(e) => {
                        tracing::warn!(
                            resource = %self.resource,
                            entity_id = %ticket.entity_id,
                            error = %e,
                            "Keeping speculative value, response did not decode"
                        );
                        None
                    }
                },
            };
            store.commit_mutation(ticket.id, authoritative)
        };

        match settled {
            Ok(settled) => tracing::debug!(
                resource = %self.resource,
                entity_id = %settled.entity_id,
                kind = %settled.kind,
                applied = settled.applied,
                replayed = settled.replayed.len(),
                "Mutation committed"
            ),
            Err(e) => tracing::warn!(resource = %self.resource, error = %e, "Commit of unknown mutation"),
        }
        self.notify();
    }

    fn rollback(&self, ticket: &MutationTicket, reason: &SyncError) {
        if self.is_detached() {
            return;
        }

        let settled = self.lock().rollback_mutation(ticket.id);
        match settled {
            Ok(settled) => tracing::warn!(
                resource = %self.resource,
                entity_id = %settled.entity_id,
                kind = %settled.kind,
                applied = settled.applied,
                reason = %reason,
                "Mutation rolled back"
            ),
            Err(e) => tracing::warn!(resource = %self.resource, error = %e, "Rollback of unknown mutation"),
        }
        self.notify();
    }

    // ------------------------------------------------------------------
    // Pushed events
    // ------------------------------------------------------------------

    /// Reconcile one pushed change. Returns None when it was dropped.
    pub fn on_event(&self, raw: &RawChange) -> Option<EventOutcome> {
        if self.is_detached() {
            return None;
        }

        let outcome = {
            let mut store = self.lock();
            let event = match store.decode_change(raw) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(resource = %self.resource, op = ?raw.op, error = %e, "Dropping undecodable change");
                    return None;
                }
            };
            let entity_id = event.entity.id.clone();
            let outcome = store.apply_event(event);
            match outcome {
                EventOutcome::Suppressed => {
                    tracing::trace!(resource = %self.resource, entity_id = %entity_id, "Change held behind pending mutation")
                }
                EventOutcome::Ignored => {
                    tracing::debug!(resource = %self.resource, entity_id = %entity_id, "Change for deleted entity ignored")
                }
                _ => {}
            }
            outcome
        };
        self.notify();
        Some(outcome)
    }

    /// A subscription handler feeding this collection.
    ///
    /// Holds the collection weakly; on `Resynced` it refreshes, since events
    /// during the outage were lost.
    pub fn handler(self: &Arc<Self>) -> Handler {
        let weak = Arc::downgrade(self);
        Arc::new(move |event: SubscriptionEvent| {
            let Some(collection) = weak.upgrade() else {
                return;
            };
            match event {
                SubscriptionEvent::Change(raw) => {
                    collection.on_event(&raw);
                }
                SubscriptionEvent::Resynced => {
                    tracing::info!(resource = %collection.resource, "Resyncing after reconnect");
                    tokio::spawn(async move {
                        collection.refresh().await;
                    });
                }
            }
        })
    }

    /// Open (or join) the channel for this collection's resource and filter.
    pub async fn subscribe(
        self: &Arc<Self>,
        manager: &Arc<SubscriptionManager>,
    ) -> Result<SubscriptionHandle> {
        manager
            .open(&self.resource, &self.filter, self.handler())
            .await
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Export the confirmed state.
    pub fn export_snapshot(&self) -> CollectionSnapshot {
        self.read(|store| store.export_snapshot())
    }

    /// Warm-start from a snapshot.
    pub fn import_snapshot(&self, snapshot: CollectionSnapshot) -> Result<()> {
        self.lock().import_snapshot(snapshot)?;
        self.notify();
        Ok(())
    }
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("resource", &self.resource)
            .field("filter", &self.filter.expression())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Rolls back a mutation whose `perform` future was dropped mid-flight.
struct PendingGuard<'a> {
    collection: &'a LiveCollection,
    ticket: Option<MutationId>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(id) = self.ticket.take() else {
            return;
        };
        if self.collection.is_detached() {
            return;
        }
        if let Ok(settled) = self.collection.lock().rollback_mutation(id) {
            tracing::warn!(
                resource = %self.collection.resource,
                entity_id = %settled.entity_id,
                kind = %settled.kind,
                "Mutation cancelled, rolled back"
            );
        }
        self.collection.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryResource;
    use livelist_engine::{FieldDef, FieldType};
    use serde_json::json;

    fn comment_schema() -> EntitySchema {
        EntitySchema::new(vec![
            FieldDef::required("body", FieldType::String),
            FieldDef::optional("likes", FieldType::Int),
            FieldDef::optional("isLiked", FieldType::Bool),
        ])
    }

    fn setup(count: i64) -> (Arc<MemoryResource>, Arc<LiveCollection>) {
        let backend = MemoryResource::new_shared();
        backend.seed(
            "comments",
            (1..=count).map(|i| json!({"id": i, "post_id": 1, "body": format!("c{}", i), "likes": 0})),
        );
        let collection = LiveCollection::new(
            backend.clone(),
            "comments",
            Filter::all().eq("post_id", 1),
            comment_schema(),
            CollectionOptions::default()
                .with_page_size(2)
                .with_sort(SortOrder::OldestFirst),
        );
        (backend, collection)
    }

    #[tokio::test]
    async fn load_pages() {
        let (_, collection) = setup(3);

        let outcome = collection.refresh().await;
        assert_eq!(
            outcome,
            LoadOutcome::Loaded(PageApplied {
                added: 2,
                skipped: 0
            })
        );
        assert!(collection.has_more());
        assert_eq!(collection.total_count(), 3);

        collection.load_more().await;
        assert_eq!(collection.ids(), [1, 2, 3].map(EntityId::Int));
        assert!(!collection.has_more());
    }

    #[tokio::test]
    async fn load_failure_keeps_items() {
        let (backend, collection) = setup(2);
        collection.refresh().await;

        backend.fail_next_query(crate::resource::ResourceError::Transport("offline".into()));
        let outcome = collection.refresh().await;

        assert!(matches!(outcome, LoadOutcome::Failed(SyncError::Fetch(_))));
        assert_eq!(collection.status(), LoadStatus::Error);
        assert_eq!(collection.len(), 2);
    }

    #[tokio::test]
    async fn perform_requires_session() {
        let (backend, collection) = setup(1);
        collection.refresh().await;
        backend.set_session(None);

        let result = collection.perform(Mutation::delete(1)).await;
        assert_eq!(result, Err(SyncError::NotAuthenticated));
        assert_eq!(collection.len(), 1);
        assert_eq!(backend.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn detached_collection_ignores_everything() {
        let (_, collection) = setup(2);
        collection.detach();

        assert_eq!(collection.refresh().await, LoadOutcome::Detached);
        assert!(collection
            .on_event(&RawChange::insert(json!({"id": 9, "body": "x"})))
            .is_none());
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn detached_collection_rejects_mutations() {
        let (backend, collection) = setup(2);
        collection.refresh().await;
        collection.detach();

        let result = collection.perform(Mutation::delete(1)).await;

        assert_eq!(result, Err(SyncError::Detached));
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.pending_count(), 0);
        assert_eq!(backend.mutation_calls(), 0);
    }
}
