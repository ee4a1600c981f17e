//! Entity types for cached records.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Stable identifier of an entity within a collection.
///
/// Backends hand out either integer keys (comments, ratings) or string keys
/// (uuids); both are accepted and compared by variant first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl EntityId {
    /// Read an id from a JSON value.
    ///
    /// Integral numbers become [`EntityId::Int`], strings become
    /// [`EntityId::Text`]. Anything else is rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(EntityId::Int)
                .ok_or_else(|| Error::InvalidId(n.to_string())),
            Value::String(s) if !s.is_empty() => Ok(EntityId::Text(s.clone())),
            other => Err(Error::InvalidId(other.to_string())),
        }
    }

    /// Convert the id back into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            EntityId::Int(n) => Value::from(*n),
            EntityId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(n) => write!(f, "{}", n),
            EntityId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Text(value)
    }
}

/// A record held in a collection.
///
/// Attribute names use the internal camelCase shape; conversion from the
/// backend's snake_case happens in [`crate::EntitySchema`] before an entity
/// is built. A clone of an entity is its rollback snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier within the collection
    pub id: EntityId,
    /// Attribute values keyed by camelCase name
    pub attributes: Map<String, Value>,
}

impl Entity {
    /// Create an entity from an attribute map.
    pub fn new(id: impl Into<EntityId>, attributes: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }

    /// Create an entity from a JSON object.
    pub fn from_json(id: impl Into<EntityId>, attributes: Value) -> Result<Self> {
        match attributes {
            Value::Object(map) => Ok(Self::new(id, map)),
            _ => Err(Error::InvalidPayload("attributes must be an object".into())),
        }
    }

    /// Get an attribute.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    /// Set a single attribute.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.attributes.insert(field.into(), value);
    }

    /// Merge a patch into the attributes (shallow, patch wins).
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Copy `fields` from `source`, dropping those it lacks. An empty list
    /// copies the whole entity.
    pub fn restore(&mut self, source: &Entity, fields: &[String]) {
        if fields.is_empty() {
            self.attributes = source.attributes.clone();
            return;
        }
        for field in fields {
            match source.attributes.get(field) {
                Some(value) => self.attributes.insert(field.clone(), value.clone()),
                None => self.attributes.remove(field),
            };
        }
    }

    /// Render the entity as a flat JSON object including its id.
    pub fn to_json(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("id".to_string(), self.id.to_json());
        Value::Object(map)
    }
}
