//! Subscription manager.
//!
//! Tracks open backend channels, one per (resource, filter) key, and routes
//! their signals to the most recent handler. Channels are reference counted:
//! opening an open key only adds a holder, and the channel is torn down when
//! the last holder closes.

use crate::error::{Result, SyncError};
use crate::resource::{Channel, ChannelSignal, Filter, ResourceClient};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use livelist_engine::RawChange;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Identity of a logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub resource: String,
    /// Canonical filter expression
    pub filter: String,
}

impl SubscriptionKey {
    pub fn new(resource: &str, filter: &Filter) -> Self {
        Self {
            resource: resource.to_string(),
            filter: filter.expression(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.resource, self.filter)
    }
}

/// State of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Connecting,
    Active,
    /// Transport lost; events may be missed until it comes back
    Degraded,
    Closed,
}

/// What a handler receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Change(RawChange),
    /// The channel recovered from a degraded transport. Events during the gap
    /// are lost, so the holder should re-query.
    Resynced,
}

/// Callback receiving a channel's events.
pub type Handler = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

struct Delivery {
    handle_id: String,
    handler: Handler,
}

struct ChannelEntry {
    /// Holders, oldest first; the last one receives events
    holders: Vec<Arc<Delivery>>,
    target: Arc<ArcSwapOption<Delivery>>,
    status: Arc<watch::Sender<SubscriptionStatus>>,
    channel: Option<Box<dyn Channel>>,
    pump: JoinHandle<()>,
}

impl Drop for ChannelEntry {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(channel) = self.channel.take() {
            channel.unsubscribe();
        }
        self.target.store(None);
        self.status.send_replace(SubscriptionStatus::Closed);
    }
}

/// Manages the channels of one backend.
///
/// Thread-safe and shared via `Arc`; handles keep the manager alive.
pub struct SubscriptionManager {
    client: Arc<dyn ResourceClient>,
    channels: DashMap<SubscriptionKey, ChannelEntry>,
    /// Serializes channel creation so one key never gets two channels
    open_lock: Mutex<()>,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            channels: DashMap::new(),
            open_lock: Mutex::new(()),
        }
    }

    /// Create a new subscription manager wrapped in Arc for sharing.
    pub fn new_shared(client: Arc<dyn ResourceClient>) -> Arc<Self> {
        Arc::new(Self::new(client))
    }

    /// Open (or join) the channel for `resource` + `filter`.
    ///
    /// Delivery is rebound to `handler` until this handle closes.
    pub async fn open(
        self: &Arc<Self>,
        resource: &str,
        filter: &Filter,
        handler: Handler,
    ) -> Result<SubscriptionHandle> {
        let key = SubscriptionKey::new(resource, filter);
        let delivery = Arc::new(Delivery {
            handle_id: uuid::Uuid::new_v4().to_string(),
            handler,
        });
        let handle = SubscriptionHandle {
            id: delivery.handle_id.clone(),
            key: key.clone(),
            manager: Arc::clone(self),
            closed: AtomicBool::new(false),
        };

        let _guard = self.open_lock.lock().await;

        if let Some(mut entry) = self.channels.get_mut(&key) {
            entry.holders.push(Arc::clone(&delivery));
            entry.target.store(Some(delivery));
            tracing::debug!(
                resource = %key.resource,
                filter = %key.filter,
                refcount = entry.holders.len(),
                "Joined existing channel"
            );
            return Ok(handle);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = match self.client.subscribe(resource, filter, tx).await {
            Ok(channel) => channel,
            Err(e) => {
                // Nothing was registered; the handle must not release anything
                handle.closed.store(true, Ordering::SeqCst);
                tracing::warn!(resource = %key.resource, filter = %key.filter, error = %e, "Subscribe failed");
                return Err(SyncError::Subscribe(e.to_string()));
            }
        };

        let target = Arc::new(ArcSwapOption::from(Some(Arc::clone(&delivery))));
        let (status_tx, _) = watch::channel(SubscriptionStatus::Connecting);
        let status = Arc::new(status_tx);
        let pump = tokio::spawn(pump(
            key.clone(),
            rx,
            Arc::clone(&target),
            Arc::clone(&status),
        ));

        self.channels.insert(
            key.clone(),
            ChannelEntry {
                holders: vec![delivery],
                target,
                status,
                channel: Some(channel),
                pump,
            },
        );

        tracing::info!(resource = %key.resource, filter = %key.filter, "Channel opened");

        Ok(handle)
    }

    /// Drop one holder; tear the channel down when none remain.
    fn release(&self, key: &SubscriptionKey, handle_id: &str) {
        let remaining = match self.channels.get_mut(key) {
            Some(mut entry) => {
                entry.holders.retain(|d| d.handle_id != handle_id);
                let fallback = entry.holders.last().cloned();
                entry.target.store(fallback);
                entry.holders.len()
            }
            None => return,
        };

        if remaining > 0 {
            tracing::debug!(resource = %key.resource, filter = %key.filter, refcount = remaining, "Channel holder released");
            return;
        }

        // Dropping the entry unsubscribes and stops the pump
        if self
            .channels
            .remove_if(key, |_, entry| entry.holders.is_empty())
            .is_some()
        {
            tracing::info!(resource = %key.resource, filter = %key.filter, "Channel torn down");
        }
    }

    /// Status of the channel for `resource` + `filter`.
    pub fn status(&self, resource: &str, filter: &Filter) -> SubscriptionStatus {
        self.status_of(&SubscriptionKey::new(resource, filter))
    }

    fn status_of(&self, key: &SubscriptionKey) -> SubscriptionStatus {
        self.channels
            .get(key)
            .map(|entry| *entry.status.borrow())
            .unwrap_or(SubscriptionStatus::Closed)
    }

    /// Watch status changes of an open channel.
    pub fn watch_status(
        &self,
        resource: &str,
        filter: &Filter,
    ) -> Option<watch::Receiver<SubscriptionStatus>> {
        self.channels
            .get(&SubscriptionKey::new(resource, filter))
            .map(|entry| entry.status.subscribe())
    }

    /// Number of holders of a channel.
    pub fn refcount(&self, resource: &str, filter: &Filter) -> usize {
        self.channels
            .get(&SubscriptionKey::new(resource, filter))
            .map(|entry| entry.holders.len())
            .unwrap_or(0)
    }

    /// Get the number of open channels.
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }
}

/// Forward a channel's signals to its current handler.
async fn pump(
    key: SubscriptionKey,
    mut rx: mpsc::UnboundedReceiver<ChannelSignal>,
    target: Arc<ArcSwapOption<Delivery>>,
    status: Arc<watch::Sender<SubscriptionStatus>>,
) {
    let deliver = |event: SubscriptionEvent| {
        if let Some(delivery) = target.load_full() {
            (delivery.handler)(event);
        }
    };

    while let Some(signal) = rx.recv().await {
        match signal {
            ChannelSignal::Connected => {
                let previous = status.send_replace(SubscriptionStatus::Active);
                if previous == SubscriptionStatus::Degraded {
                    tracing::info!(resource = %key.resource, filter = %key.filter, "Channel recovered");
                    deliver(SubscriptionEvent::Resynced);
                }
            }
            ChannelSignal::Disconnected => {
                status.send_replace(SubscriptionStatus::Degraded);
                tracing::warn!(resource = %key.resource, filter = %key.filter, "Channel degraded");
            }
            ChannelSignal::Change(change) => {
                tracing::trace!(resource = %key.resource, op = ?change.op, "Change received");
                deliver(SubscriptionEvent::Change(change));
            }
        }
    }

    tracing::debug!(resource = %key.resource, filter = %key.filter, "Channel pump stopped");
}

/// A holder's claim on a channel.
///
/// Closing is idempotent; dropping the handle closes it.
pub struct SubscriptionHandle {
    id: String,
    key: SubscriptionKey,
    manager: Arc<SubscriptionManager>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Status of the underlying channel (`Closed` once this handle closed).
    pub fn status(&self) -> SubscriptionStatus {
        if self.is_closed() {
            return SubscriptionStatus::Closed;
        }
        self.manager.status_of(&self.key)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release this holder.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.manager.release(&self.key, &self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}
