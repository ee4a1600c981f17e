//! Livelist demo - a comment thread kept live against the in-memory backend.
//!
//! Loads a page of comments, likes one optimistically, receives a comment
//! written by "another client", and shows a rejected write being rolled back.

use livelist_client::{
    CollectionOptions, CollectionRegistry, Filter, MemoryResource, ResourceClient, ResourceError,
    SubscriptionManager, SyncConfig, ViewScope,
};
use livelist_engine::{EntitySchema, FieldDef, FieldType, Mutation, SortOrder, WriteOp};
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livelist_client=debug,livelist_demo=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    tracing::info!(
        page_size = config.page_size,
        mutation_timeout = ?config.mutation_timeout,
        "Starting livelist demo"
    );

    let backend = MemoryResource::new_shared();
    backend.seed(
        "comments",
        (1..=5).map(|i| {
            json!({
                "id": i,
                "post_id": 1,
                "body": format!("comment #{}", i),
                "like_count": i,
                "is_liked": false,
            })
        }),
    );

    let manager = SubscriptionManager::new_shared(backend.clone());
    let registry = CollectionRegistry::new(
        backend.clone(),
        CollectionOptions::from(&config).with_sort(SortOrder::OldestFirst),
    );

    let schema = EntitySchema::new(vec![
        FieldDef::required("body", FieldType::String),
        FieldDef::optional("likeCount", FieldType::Int),
        FieldDef::optional("isLiked", FieldType::Bool),
    ]);
    let filter = Filter::all().eq("post_id", 1);

    let mut view = ViewScope::new("post-1");
    let comments = view
        .watch(&manager, registry.collection("comments", &filter, schema))
        .await?;

    let outcome = comments.refresh().await;
    tracing::info!(?outcome, items = comments.len(), has_more = comments.has_more(), "Loaded");

    // Optimistic like
    comments
        .perform(Mutation::toggle(2, "isLiked").with_counter("likeCount"))
        .await?;
    if let Some(liked) = comments.get(&2.into()) {
        tracing::info!(entity = %liked.to_json(), "Liked");
    }

    // Another client comments on the same post
    backend
        .mutate(
            "comments",
            WriteOp::Insert,
            json!({"post_id": 1, "body": "hello from elsewhere", "like_count": 0}),
        )
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(items = comments.len(), "After remote insert");

    // A rejected write rolls back
    backend.fail_next_mutation(ResourceError::Rejected("permission denied".into()));
    if let Err(e) = comments.perform(Mutation::delete(1)).await {
        tracing::info!(error = %e, items = comments.len(), "Delete rolled back");
    }

    let snapshot = comments.export_snapshot();
    tracing::info!(snapshot = %snapshot.to_json()?, "Confirmed state");

    view.close();
    tracing::info!(open_channels = manager.active_channels(), "View closed");

    Ok(())
}
