//! Integration tests for pushed changes, shared collections and view teardown.

use livelist_client::{
    CollectionOptions, CollectionRegistry, Filter, LiveCollection, LoadOutcome, MemoryResource,
    ResourceClient, ResourceError, SubscriptionManager, SubscriptionStatus, SyncError, ViewScope,
};
use livelist_engine::{
    EntityId, EntitySchema, FieldDef, FieldType, Mutation, RawChange, SortOrder, WriteOp,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    backend: Arc<MemoryResource>,
    manager: Arc<SubscriptionManager>,
    registry: CollectionRegistry,
}

impl Harness {
    fn new(count: i64) -> Self {
        let backend = MemoryResource::new_shared();
        backend.seed(
            "comments",
            (1..=count).map(|i| {
                json!({
                    "id": i,
                    "post_id": 1,
                    "body": format!("comment {}", i),
                    "like_count": 0,
                    "is_liked": false,
                })
            }),
        );
        let manager = SubscriptionManager::new_shared(backend.clone());
        let registry = CollectionRegistry::new(
            backend.clone(),
            CollectionOptions::default().with_sort(SortOrder::OldestFirst),
        );
        Self {
            backend,
            manager,
            registry,
        }
    }

    fn comments(&self) -> Arc<LiveCollection> {
        self.registry.collection("comments", &filter(), comment_schema())
    }
}

fn comment_schema() -> EntitySchema {
    EntitySchema::new(vec![
        FieldDef::required("body", FieldType::String),
        FieldDef::optional("likeCount", FieldType::Int),
        FieldDef::optional("isLiked", FieldType::Bool),
    ])
}

fn filter() -> Filter {
    Filter::all().eq("post_id", 1)
}

fn id(n: i64) -> EntityId {
    EntityId::Int(n)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// ============================================================================
// Pushed changes
// ============================================================================

#[tokio::test]
async fn test_remote_insert_appears() {
    let h = Harness::new(2);
    let mut view = ViewScope::new("thread");
    let comments = view.watch(&h.manager, h.comments()).await.unwrap();
    comments.refresh().await;

    h.backend
        .mutate(
            "comments",
            WriteOp::Insert,
            json!({"post_id": 1, "body": "from another device"}),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(comments.ids(), vec![id(1), id(2), id(3)]);
    assert_eq!(
        comments.get(&id(3)).unwrap().get("body"),
        Some(&json!("from another device"))
    );
}

#[tokio::test]
async fn test_other_filters_are_not_delivered() {
    let h = Harness::new(1);
    let mut view = ViewScope::new("thread");
    let comments = view.watch(&h.manager, h.comments()).await.unwrap();
    comments.refresh().await;

    h.backend
        .mutate(
            "comments",
            WriteOp::Insert,
            json!({"post_id": 2, "body": "elsewhere"}),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(comments.len(), 1);
}

#[tokio::test]
async fn test_push_during_failed_toggle_is_replayed() {
    let h = Harness::new(1);
    let mut view = ViewScope::new("thread");
    let comments = view.watch(&h.manager, h.comments()).await.unwrap();
    comments.refresh().await;
    h.backend.hold_mutations();
    h.backend
        .fail_next_mutation(ResourceError::Transport("socket closed".into()));

    let toggle = {
        let comments = Arc::clone(&comments);
        tokio::spawn(async move { comments.perform(Mutation::toggle(1, "isLiked")).await })
    };
    settle().await;

    // Another client edits the same comment while the like is in flight
    h.backend.emit(
        "comments",
        RawChange::update(
            None,
            json!({"id": 1, "post_id": 1, "body": "edited", "is_liked": false}),
        ),
    );
    settle().await;
    let speculative = comments.get(&id(1)).unwrap();
    assert_eq!(speculative.get("body"), Some(&json!("comment 1")));
    assert_eq!(speculative.get_bool("isLiked"), Some(true));

    h.backend.release_mutations();
    assert!(toggle.await.unwrap().is_err());

    let entity = comments.get(&id(1)).unwrap();
    assert_eq!(entity.get("body"), Some(&json!("edited")));
    assert_eq!(entity.get_bool("isLiked"), Some(false));
}

#[tokio::test]
async fn test_delete_beats_late_update() {
    let h = Harness::new(3);
    let mut view = ViewScope::new("thread");
    let comments = view.watch(&h.manager, h.comments()).await.unwrap();
    comments.refresh().await;

    comments.perform(Mutation::delete(2)).await.unwrap();
    settle().await;
    assert_eq!(comments.ids(), vec![id(1), id(3)]);
    assert_eq!(comments.total_count(), 2);

    // A stale update for the deleted row arrives afterwards
    h.backend.emit(
        "comments",
        RawChange::update(None, json!({"id": 2, "post_id": 1, "body": "zombie"})),
    );
    settle().await;

    assert_eq!(comments.ids(), vec![id(1), id(3)]);
}

#[tokio::test]
async fn test_remote_delete_removes_entity() {
    let h = Harness::new(2);
    let mut view = ViewScope::new("thread");
    let comments = view.watch(&h.manager, h.comments()).await.unwrap();
    comments.refresh().await;

    h.backend
        .mutate("comments", WriteOp::Delete, json!({"id": 1}))
        .await
        .unwrap();
    settle().await;

    assert_eq!(comments.ids(), vec![id(2)]);
}

#[tokio::test]
async fn test_reconnect_triggers_refresh() {
    let h = Harness::new(2);
    let mut view = ViewScope::new("thread");
    let comments = view.watch(&h.manager, h.comments()).await.unwrap();
    comments.refresh().await;
    settle().await;

    h.backend.disconnect();
    settle().await;
    assert_eq!(
        h.manager.status("comments", &filter()),
        SubscriptionStatus::Degraded
    );

    // Lost while the transport is down
    h.backend
        .mutate(
            "comments",
            WriteOp::Insert,
            json!({"post_id": 1, "body": "missed"}),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(comments.len(), 2);

    h.backend.reconnect();
    settle().await;

    assert_eq!(
        h.manager.status("comments", &filter()),
        SubscriptionStatus::Active
    );
    assert_eq!(comments.len(), 3);
    assert_eq!(h.backend.query_calls(), 2);
}

// ============================================================================
// Sharing and teardown
// ============================================================================

#[tokio::test]
async fn test_views_share_one_collection_and_channel() {
    let h = Harness::new(2);
    let mut feed = ViewScope::new("feed");
    let mut detail = ViewScope::new("detail");

    let a = feed.watch(&h.manager, h.comments()).await.unwrap();
    let b = detail.watch(&h.manager, h.comments()).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(h.backend.subscribe_calls(), 1);
    assert_eq!(h.manager.refcount("comments", &filter()), 2);

    a.refresh().await;
    a.perform(Mutation::toggle(1, "isLiked")).await.unwrap();
    assert_eq!(b.get(&id(1)).unwrap().get_bool("isLiked"), Some(true));

    // Closing one view keeps the other live
    detail.close();
    assert!(!a.is_detached());
    assert_eq!(h.manager.refcount("comments", &filter()), 1);

    h.backend
        .mutate("comments", WriteOp::Insert, json!({"post_id": 1, "body": "new"}))
        .await
        .unwrap();
    settle().await;
    assert_eq!(a.len(), 3);
}

#[tokio::test]
async fn test_closing_last_view_tears_down() {
    let h = Harness::new(2);
    let comments = h.comments();
    {
        let mut view = ViewScope::new("thread");
        view.watch(&h.manager, Arc::clone(&comments)).await.unwrap();
        comments.refresh().await;
        assert_eq!(h.manager.active_channels(), 1);
    }

    assert_eq!(h.manager.active_channels(), 0);
    assert_eq!(h.backend.active_subscriptions(), 0);
    assert!(comments.is_detached());
    assert_eq!(comments.refresh().await, LoadOutcome::Detached);
}

#[tokio::test]
async fn test_reentering_a_view_gets_a_live_collection() {
    let h = Harness::new(2);
    let mut first = ViewScope::new("thread");
    let stale = first.watch(&h.manager, h.comments()).await.unwrap();
    stale.refresh().await;
    first.close();
    assert!(stale.is_detached());

    // The old Arc is still held, yet the next view gets a working collection
    let mut second = ViewScope::new("thread");
    let fresh = second.watch(&h.manager, h.comments()).await.unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert!(matches!(fresh.refresh().await, LoadOutcome::Loaded(_)));
    assert_eq!(fresh.len(), 2);

    h.backend
        .mutate("comments", WriteOp::Insert, json!({"post_id": 1, "body": "back again"}))
        .await
        .unwrap();
    settle().await;
    assert_eq!(fresh.len(), 3);

    fresh.perform(Mutation::toggle(1, "isLiked")).await.unwrap();
    assert_eq!(
        stale.perform(Mutation::toggle(2, "isLiked")).await,
        Err(SyncError::Detached)
    );
}

#[tokio::test]
async fn test_late_response_after_teardown_is_ignored() {
    let h = Harness::new(2);
    let comments = h.comments();
    let mut view = ViewScope::new("thread");
    view.watch(&h.manager, Arc::clone(&comments)).await.unwrap();
    comments.refresh().await;
    h.backend.hold_mutations();

    let delete = {
        let comments = Arc::clone(&comments);
        tokio::spawn(async move { comments.perform(Mutation::delete(1)).await })
    };
    settle().await;
    let before = comments.snapshot();

    view.close();
    h.backend.release_mutations();
    delete.await.unwrap().unwrap();

    assert_eq!(comments.snapshot(), before);
    assert!(h.backend.row("comments", &json!(1)).is_none());
}
