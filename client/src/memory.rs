//! In-process backend.
//!
//! [`MemoryResource`] keeps tables of raw rows in memory and behaves like a
//! realtime backend: writes are broadcast to matching channels, the transport
//! can be dropped and restored, and failures can be scripted. It backs the
//! demo binary and the async tests.

use crate::resource::{
    Channel, ChannelSignal, Filter, Page, Query, ResourceClient, ResourceError, Session,
    SignalSink,
};
use async_trait::async_trait;
use dashmap::DashMap;
use livelist_engine::{RawChange, WriteOp};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Column holding the primary key.
pub const ID_COLUMN: &str = "id";
/// Column stamped on inserted rows, used for chronological ordering.
pub const CREATED_AT_COLUMN: &str = "created_at";

#[derive(Debug)]
struct Subscriber {
    table: String,
    filter: Filter,
    sink: SignalSink,
}

type Subscribers = Arc<DashMap<String, Subscriber>>;

struct MemoryChannel {
    id: String,
    subscribers: Subscribers,
}

impl Channel for MemoryChannel {
    fn unsubscribe(self: Box<Self>) {
        if self.subscribers.remove(&self.id).is_some() {
            tracing::debug!(channel = %self.id, "Memory channel unsubscribed");
        }
    }
}

/// In-memory realtime backend.
pub struct MemoryResource {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    next_id: AtomicI64,
    clock: AtomicI64,
    subscribers: Subscribers,
    connected: AtomicBool,
    session: Mutex<Option<Session>>,
    query_failures: Mutex<VecDeque<ResourceError>>,
    mutation_failures: Mutex<VecDeque<ResourceError>>,
    gate: watch::Sender<bool>,
    query_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl Default for MemoryResource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResource {
    /// Create an empty backend with a signed-in session.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            clock: AtomicI64::new(1),
            subscribers: Arc::new(DashMap::new()),
            connected: AtomicBool::new(true),
            session: Mutex::new(Some(Session {
                user_id: "local-user".to_string(),
            })),
            query_failures: Mutex::new(VecDeque::new()),
            mutation_failures: Mutex::new(VecDeque::new()),
            gate,
            query_calls: AtomicUsize::new(0),
            mutation_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Create a backend wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Insert rows without broadcasting. Rows without an id get one.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(obj) = row {
                stored.push(Value::Object(self.stamp(obj)));
            }
        }
    }

    /// Current rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up one row by id.
    pub fn row(&self, table: &str, id: &Value) -> Option<Value> {
        self.rows(table)
            .into_iter()
            .find(|row| row.get(ID_COLUMN) == Some(id))
    }

    /// Deliver a change to matching channels as if another client wrote it.
    /// Table contents are not touched.
    pub fn emit(&self, table: &str, change: RawChange) -> usize {
        self.broadcast(table, change)
    }

    fn stamp(&self, mut obj: Map<String, Value>) -> Map<String, Value> {
        if !obj.contains_key(ID_COLUMN) {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            obj.insert(ID_COLUMN.to_string(), Value::from(id));
        } else if let Some(id) = obj.get(ID_COLUMN).and_then(Value::as_i64) {
            self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        }
        if !obj.contains_key(CREATED_AT_COLUMN) {
            let now = self.clock.fetch_add(1, Ordering::SeqCst);
            obj.insert(CREATED_AT_COLUMN.to_string(), Value::from(now));
        }
        obj
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Drop the transport. Writes keep working but their events are lost.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("Memory transport disconnected");
            self.signal_all(ChannelSignal::Disconnected);
        }
    }

    /// Restore the transport.
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!("Memory transport reconnected");
            self.signal_all(ChannelSignal::Connected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn signal_all(&self, signal: ChannelSignal) {
        for entry in self.subscribers.iter() {
            let _ = entry.value().sink.send(signal.clone());
        }
    }

    fn broadcast(&self, table: &str, change: RawChange) -> usize {
        if !self.is_connected() {
            tracing::debug!(table = %table, "Transport down, change not delivered");
            return 0;
        }

        let mut sent_count = 0;
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if sub.table != table {
                continue;
            }
            let visible = [&change.new, &change.old]
                .into_iter()
                .flatten()
                .any(|row| sub.filter.matches(row));
            if visible && sub.sink.send(ChannelSignal::Change(change.clone())).is_ok() {
                sent_count += 1;
            }
        }

        tracing::debug!(table = %table, recipients = sent_count, "Broadcast change");
        sent_count
    }

    /// Number of open channels.
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.len()
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Make the next query fail.
    pub fn fail_next_query(&self, error: ResourceError) {
        self.query_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Make the next mutation fail.
    pub fn fail_next_mutation(&self, error: ResourceError) {
        self.mutation_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Park mutations until [`MemoryResource::release_mutations`].
    pub fn hold_mutations(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_mutations(&self) {
        self.gate.send_replace(true);
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    fn apply_write(
        &self,
        table: &str,
        op: WriteOp,
        payload: Value,
    ) -> Result<(Option<Value>, RawChange), ResourceError> {
        let Value::Object(obj) = payload else {
            return Err(ResourceError::Rejected("payload must be an object".into()));
        };

        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.entry(table.to_string()).or_default();

        if op == WriteOp::Insert {
            let row = Value::Object(self.stamp(obj));
            rows.push(row.clone());
            return Ok((Some(row.clone()), RawChange::insert(row)));
        }

        let id = obj
            .get(ID_COLUMN)
            .cloned()
            .ok_or_else(|| ResourceError::Rejected("payload has no id".into()))?;
        let index = rows
            .iter()
            .position(|row| row.get(ID_COLUMN) == Some(&id))
            .ok_or_else(|| ResourceError::Rejected(format!("row {} not found", id)))?;

        match op {
            WriteOp::Delete => {
                let old = rows.remove(index);
                Ok((Some(old.clone()), RawChange::delete(old)))
            }
            _ => {
                let old = rows[index].clone();
                if let Value::Object(current) = &mut rows[index] {
                    for (key, value) in obj {
                        current.insert(key, value);
                    }
                }
                let new = rows[index].clone();
                Ok((Some(new.clone()), RawChange::update(Some(old), new)))
            }
        }
    }
}

#[async_trait]
impl ResourceClient for MemoryResource {
    async fn query(
        &self,
        table: &str,
        filter: &Filter,
        query: &Query,
    ) -> Result<Page, ResourceError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .query_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(error);
        }

        let mut rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect();
        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| order.compare(a, b));
        }

        let total = rows.len() as u64;
        let rows = rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        Ok(Page {
            rows,
            total: Some(total),
        })
    }

    async fn mutate(
        &self,
        table: &str,
        op: WriteOp,
        payload: Value,
    ) -> Result<Option<Value>, ResourceError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(ResourceError::Transport("backend shut down".into()));
        }

        if let Some(error) = self
            .mutation_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(error);
        }

        let (row, change) = self.apply_write(table, op, payload)?;
        self.broadcast(table, change);
        Ok(row)
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: &Filter,
        sink: SignalSink,
    ) -> Result<Box<dyn Channel>, ResourceError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let id = uuid::Uuid::new_v4().to_string();

        if self.is_connected() {
            let _ = sink.send(ChannelSignal::Connected);
        }
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                table: table.to_string(),
                filter: filter.clone(),
                sink,
            },
        );

        tracing::debug!(channel = %id, table = %table, filter = %filter, "Memory channel opened");

        Ok(Box::new(MemoryChannel {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }))
    }

    fn session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::OrderBy;
    use livelist_engine::ChangeOp;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn insert_assigns_ids_and_broadcasts() {
        let backend = MemoryResource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _channel = backend
            .subscribe("comments", &Filter::all().eq("post_id", 1), tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ChannelSignal::Connected));

        let row = backend
            .mutate("comments", WriteOp::Insert, json!({"post_id": 1, "body": "hi"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["id"], json!(1));

        match rx.recv().await {
            Some(ChannelSignal::Change(change)) => assert_eq!(change.op, ChangeOp::Insert),
            other => panic!("expected change, got {:?}", other),
        }

        // Other posts are filtered out
        backend
            .mutate("comments", WriteOp::Insert, json!({"post_id": 2, "body": "x"}))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn query_filters_orders_and_pages() {
        let backend = MemoryResource::new();
        backend.seed(
            "ratings",
            (1..=5).map(|i| json!({"id": i, "food_id": 9, "score": i})),
        );
        backend.seed("ratings", [json!({"id": 6, "food_id": 1, "score": 10})]);

        let query = Query::page(1, 2).ordered(OrderBy {
            column: "score".into(),
            descending: true,
        });
        let page = backend
            .query("ratings", &Filter::all().eq("food_id", 9), &query)
            .await
            .unwrap();

        let ids: Vec<_> = page.rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(5), json!(4)]);
        assert_eq!(page.total, Some(5));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_once() {
        let backend = MemoryResource::new();
        backend.seed("comments", [json!({"id": 1, "body": "x"})]);
        backend.fail_next_mutation(ResourceError::Rejected("nope".into()));

        let payload = json!({"id": 1, "body": "y"});
        assert!(backend
            .mutate("comments", WriteOp::Update, payload.clone())
            .await
            .is_err());
        assert!(backend
            .mutate("comments", WriteOp::Update, payload)
            .await
            .is_ok());
        assert_eq!(backend.mutation_calls(), 2);
    }

    #[tokio::test]
    async fn disconnect_loses_events() {
        let backend = MemoryResource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = backend.subscribe("comments", &Filter::all(), tx).await.unwrap();
        rx.recv().await;

        backend.disconnect();
        assert_eq!(rx.recv().await, Some(ChannelSignal::Disconnected));
        backend
            .mutate("comments", WriteOp::Insert, json!({"body": "lost"}))
            .await
            .unwrap();
        backend.reconnect();
        assert_eq!(rx.recv().await, Some(ChannelSignal::Connected));
        assert!(rx.try_recv().is_err());

        channel.unsubscribe();
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn delete_of_missing_row_is_rejected() {
        let backend = MemoryResource::new();
        let result = backend
            .mutate("comments", WriteOp::Delete, json!({"id": 99}))
            .await;
        assert!(matches!(result, Err(ResourceError::Rejected(_))));
    }
}
