//! # Livelist Client
//!
//! Async layer that keeps [`livelist_engine`] collections in sync with a
//! realtime backend.
//!
//! - [`SubscriptionManager`]: one reference-counted channel per resource and
//!   filter, routing pushed changes to the newest holder
//! - [`LiveCollection`]: paginated loads, optimistic mutations raced against
//!   a deadline, and reconciliation of pushed changes
//! - [`CollectionRegistry`]: one live collection per resource and filter,
//!   shared between views
//! - [`ViewScope`]: releases subscriptions and detaches collections when a
//!   view goes away
//!
//! The backend sits behind the [`ResourceClient`] trait. [`MemoryResource`]
//! is an in-process implementation used by the demo and the tests.
//!
//! ```rust,no_run
//! use livelist_client::{
//!     CollectionOptions, CollectionRegistry, Filter, MemoryResource, SubscriptionManager,
//!     ViewScope,
//! };
//! use livelist_engine::{EntitySchema, FieldDef, FieldType, Mutation};
//!
//! # async fn run() -> livelist_client::Result<()> {
//! let backend = MemoryResource::new_shared();
//! let manager = SubscriptionManager::new_shared(backend.clone());
//! let registry = CollectionRegistry::new(backend, CollectionOptions::default());
//!
//! let schema = EntitySchema::new(vec![
//!     FieldDef::required("body", FieldType::String),
//!     FieldDef::optional("likes", FieldType::Int),
//!     FieldDef::optional("isLiked", FieldType::Bool),
//! ]);
//! let comments = registry.collection("comments", &Filter::all().eq("post_id", 1), schema);
//!
//! let mut view = ViewScope::new("post-1");
//! let comments = view.watch(&manager, comments).await?;
//! comments.refresh().await;
//! comments
//!     .perform(Mutation::toggle(1, "isLiked").with_counter("likes"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod config;
pub mod error;
pub mod memory;
pub mod registry;
pub mod resource;
pub mod scope;
pub mod subscription;

pub use collection::{CollectionOptions, LiveCollection, LoadOutcome};
pub use config::{ConfigError, SyncConfig, DEFAULT_PAGE_SIZE};
pub use error::{Result, SyncError};
pub use memory::MemoryResource;
pub use registry::CollectionRegistry;
pub use resource::{
    Channel, ChannelSignal, Filter, OrderBy, Page, Query, ResourceClient, ResourceError, Session,
    SignalSink,
};
pub use scope::ViewScope;
pub use subscription::{
    Handler, SubscriptionEvent, SubscriptionHandle, SubscriptionKey, SubscriptionManager,
    SubscriptionStatus,
};
