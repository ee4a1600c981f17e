//! Entity schema and boundary decoding.
//!
//! Rows coming from the backend are loosely typed JSON with snake_case keys.
//! An [`EntitySchema`] turns them into [`Entity`] values before they reach a
//! collection: keys are renamed to camelCase, declared fields are type
//! checked, and fields with a display precision are rounded once so repeated
//! reads are stable. Decoding fails closed on any shape mismatch.

use crate::{error::Result, Entity, EntityId, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field, named in the internal camelCase shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Decimal places kept for floating point values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            precision: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            precision: None,
        }
    }

    /// Optional float rounded to one decimal (nutrient percentages, ratings).
    pub fn percentage(name: impl Into<String>) -> Self {
        Self::optional(name, FieldType::Float).with_precision(1)
    }

    /// Round float values of this field to `decimals` places.
    pub fn with_precision(mut self, decimals: u32) -> Self {
        self.precision = Some(decimals);
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }

    fn round(&self, value: &mut Value) {
        let Some(decimals) = self.precision else {
            return;
        };
        if let Some(rounded) = value
            .as_f64()
            .filter(|_| value.is_f64())
            .and_then(|v| Number::from_f64(round_to(v, decimals)))
        {
            *value = Value::Number(rounded);
        }
    }
}

/// Round `value` to `decimals` places, half away from zero.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// `nutrient_protein_pct` -> `nutrientProteinPct`
pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// `isLiked` -> `is_liked`
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Shape of the entities of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Name of the id column on the wire
    pub id_field: String,
    /// Declared fields; undeclared fields pass through unchecked
    pub fields: Vec<FieldDef>,
}

impl Default for EntitySchema {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl EntitySchema {
    /// Create a schema keyed by an `id` column.
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self {
            id_field: "id".to_string(),
            fields,
        }
    }

    /// Builder-style method to rename the id column.
    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    /// Get a field definition by camelCase name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Decode a backend row into an entity.
    pub fn decode(&self, row: &Value) -> Result<Entity> {
        let obj = row
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("row must be an object".into()))?;

        let id = obj
            .get(&self.id_field)
            .ok_or_else(|| Error::MissingId(self.id_field.clone()))
            .and_then(EntityId::from_json)?;

        let mut attributes: Map<String, Value> = obj
            .iter()
            .filter(|(key, _)| **key != self.id_field)
            .map(|(key, value)| (to_camel_case(key), value.clone()))
            .collect();

        for field in &self.fields {
            field.validate(attributes.get(&field.name))?;
            if let Some(value) = attributes.get_mut(&field.name) {
                field.round(value);
            }
        }

        Ok(Entity::new(id, attributes))
    }

    /// Check and round a partial attribute map (camelCase keys).
    ///
    /// Required fields may be absent; present fields must have the declared
    /// type.
    pub fn normalize_patch(&self, patch: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = patch.clone();
        for field in &self.fields {
            if let Some(value) = out.get_mut(&field.name) {
                field.validate(Some(value))?;
                field.round(value);
            }
        }
        Ok(out)
    }

    /// Build a complete entity from a locally authored payload.
    pub fn prepare(&self, id: EntityId, attributes: &Map<String, Value>) -> Result<Entity> {
        let attributes = self.normalize_patch(attributes)?;
        for field in &self.fields {
            field.validate(attributes.get(&field.name))?;
        }
        Ok(Entity::new(id, attributes))
    }

    /// Encode camelCase attributes into a snake_case wire payload.
    pub fn encode(&self, id: Option<&EntityId>, attributes: &Map<String, Value>) -> Value {
        let mut out: Map<String, Value> = attributes
            .iter()
            .map(|(key, value)| (to_snake_case(key), value.clone()))
            .collect();
        if let Some(id) = id {
            out.insert(self.id_field.clone(), id.to_json());
        }
        Value::Object(out)
    }
}
