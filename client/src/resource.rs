//! The backend boundary.
//!
//! A [`ResourceClient`] exposes query / mutate / subscribe over a table-like
//! resource. Rows cross this boundary as loosely typed snake_case JSON and are
//! decoded into entities by the live collection.

use async_trait::async_trait;
use livelist_engine::{schema::to_snake_case, RawChange, SortOrder, WriteOp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use tokio::sync::mpsc;

/// Errors reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),
}

/// Conjunction of column equality tests.
///
/// Conditions are kept sorted by column so equal filters have equal
/// expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// A filter that matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Builder-style method adding `column = value`. A second condition on
    /// the same column replaces the first.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let column = column.into();
        let value = value.into();
        match self
            .conditions
            .binary_search_by(|(existing, _)| existing.as_str().cmp(&column))
        {
            Ok(index) => self.conditions[index].1 = value,
            Err(index) => self.conditions.insert(index, (column, value)),
        }
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Canonical expression, e.g. `kind=eq.comment&target_id=eq.42`.
    pub fn expression(&self) -> String {
        if self.conditions.is_empty() {
            return "*".to_string();
        }
        self.conditions
            .iter()
            .map(|(column, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{}=eq.{}", column, rendered)
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Whether a raw row satisfies every condition.
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// Ordering requested from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// snake_case column
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    /// Map a collection sort order onto a backend ordering. Chronological
    /// orders sort by `time_column`.
    pub fn for_sort(sort: &SortOrder, time_column: &str) -> Self {
        match sort {
            SortOrder::NewestFirst => Self {
                column: time_column.to_string(),
                descending: true,
            },
            SortOrder::OldestFirst => Self {
                column: time_column.to_string(),
                descending: false,
            },
            SortOrder::ByField { field, descending } => Self {
                column: to_snake_case(field),
                descending: *descending,
            },
        }
    }

    /// Compare two raw rows by this ordering, rows missing the column last.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ord = match (a.get(&self.column), b.get(&self.column)) {
            (Some(x), Some(y)) => compare_json(x, y),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
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

/// One page request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub limit: usize,
    pub offset: usize,
    pub order_by: Option<OrderBy>,
}

impl Query {
    /// Request 1-based `page` of `page_size` rows.
    pub fn page(page: u32, page_size: usize) -> Self {
        Self {
            limit: page_size,
            offset: (page.max(1) as usize - 1) * page_size,
            order_by: None,
        }
    }

    pub fn ordered(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }
}

/// Rows returned for a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub rows: Vec<Value>,
    /// Total matching rows, when the backend counts them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Signals delivered by a backend channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// The transport is (re)connected
    Connected,
    /// The transport dropped; events may be missed until `Connected`
    Disconnected,
    Change(RawChange),
}

/// Where a channel delivers its signals.
pub type SignalSink = mpsc::UnboundedSender<ChannelSignal>;

/// An open backend channel.
pub trait Channel: Send + Sync {
    /// Stop delivery and release the backend side.
    fn unsubscribe(self: Box<Self>);
}

/// The signed-in user, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
}

/// A table-like backend.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch rows of `table` matching `filter`.
    async fn query(
        &self,
        table: &str,
        filter: &Filter,
        query: &Query,
    ) -> Result<Page, ResourceError>;

    /// Write to `table`. The payload is snake_case and carries the id for
    /// updates and deletes. Returns the affected row when the backend echoes
    /// it.
    async fn mutate(
        &self,
        table: &str,
        op: WriteOp,
        payload: Value,
    ) -> Result<Option<Value>, ResourceError>;

    /// Open a change channel for rows of `table` matching `filter`.
    async fn subscribe(
        &self,
        table: &str,
        filter: &Filter,
        sink: SignalSink,
    ) -> Result<Box<dyn Channel>, ResourceError>;

    /// The current session.
    fn session(&self) -> Option<Session>;
}
