//! View lifetimes.
//!
//! A [`ViewScope`] owns what one screen opened. Closing it (or dropping it)
//! releases its subscriptions and detaches collections no other view holds,
//! so late responses never touch a torn-down view.

use crate::collection::LiveCollection;
use crate::error::Result;
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use std::sync::Arc;

#[derive(Debug)]
pub struct ViewScope {
    name: String,
    handles: Vec<SubscriptionHandle>,
    collections: Vec<Arc<LiveCollection>>,
}

impl ViewScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handles: Vec::new(),
            collections: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep a subscription open for the life of this scope.
    pub fn hold(&mut self, handle: SubscriptionHandle) {
        self.handles.push(handle);
    }

    /// Keep a collection alive for the life of this scope.
    pub fn attach(&mut self, collection: Arc<LiveCollection>) -> Arc<LiveCollection> {
        if !self
            .collections
            .iter()
            .any(|held| Arc::ptr_eq(held, &collection))
        {
            collection.retain_view();
            self.collections.push(Arc::clone(&collection));
        }
        collection
    }

    /// Attach a collection and subscribe it to its channel.
    pub async fn watch(
        &mut self,
        manager: &Arc<SubscriptionManager>,
        collection: Arc<LiveCollection>,
    ) -> Result<Arc<LiveCollection>> {
        let handle = collection.subscribe(manager).await?;
        self.hold(handle);
        Ok(self.attach(collection))
    }

    pub fn subscription_count(&self) -> usize {
        self.handles.len()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Release everything this scope holds. Idempotent.
    pub fn close(&mut self) {
        if self.handles.is_empty() && self.collections.is_empty() {
            return;
        }

        for handle in self.handles.drain(..) {
            handle.close();
        }
        let mut detached = 0;
        for collection in self.collections.drain(..) {
            if collection.release_view() {
                collection.detach();
                detached += 1;
            }
        }
        tracing::debug!(view = %self.name, detached, "View scope closed");
    }
}

impl Drop for ViewScope {
    fn drop(&mut self) {
        self.close();
    }
}
