//! Typed record model shared by every pipeline stage.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one tracked individual.
///
/// Integer ids stay integers through every stage; a CSV cell `17` is emitted as `17`,
/// never `17.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Integer(i64),
    Text(String),
}

impl EntityId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<i64>() {
            Ok(id) => Some(Self::Integer(id)),
            Err(_) => Some(Self::Text(trimmed.to_string())),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Field map keyed by column name. A present key with `None` is a missing reading; an
/// absent key means the source never carried the column.
pub type Fields = BTreeMap<String, Option<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity_id: EntityId,
    pub timestamp: String,
    pub fields: Fields,
}

impl RawRecord {
    pub fn new(entity_id: impl Into<EntityId>, timestamp: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp: timestamp.into(),
            fields: Fields::new(),
        }
    }

    pub fn with(mut self, column: &str, value: Option<Value>) -> Self {
        self.fields.insert(column.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    pub fields: Fields,
}

impl NormalizedRecord {
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).and_then(Option::as_ref)
    }
}

/// All readings of one entity, ascending by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGroup {
    entity_id: EntityId,
    records: Vec<NormalizedRecord>,
}

impl EntityGroup {
    /// Builds a group, stably sorting `records` by timestamp. Records that belong to a
    /// different entity are ignored.
    pub fn new(entity_id: EntityId, records: Vec<NormalizedRecord>) -> Self {
        let mut records: Vec<NormalizedRecord> = records
            .into_iter()
            .filter(|record| record.entity_id == entity_id)
            .collect();
        records.sort_by_key(|record| record.timestamp);
        Self { entity_id, records }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampledRecord {
    pub entity_id: EntityId,
    pub grid_timestamp: DateTime<Utc>,
    pub values: Fields,
}

impl ResampledRecord {
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column).and_then(Option::as_ref)
    }
}
