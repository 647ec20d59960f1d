//! Change records as handed over by the upstream change feed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::TableKey;

/// The kind of change a record describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    #[default]
    Upsert,
}

/// A single changed record.
///
/// `fields` is an ordered map (serde_json is built with `preserve_order`), so
/// filtering keeps the original column order of whatever survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The source this record belongs to.
    pub key: TableKey,

    /// What happened to the row.
    #[serde(default)]
    pub operation: Operation,

    /// Field name to value, in source order.
    pub fields: Map<String, Value>,
}

impl ChangeRecord {
    pub fn new(key: TableKey, operation: Operation, fields: Map<String, Value>) -> Self {
        ChangeRecord {
            key,
            operation,
            fields,
        }
    }

    /// Builds a record from a JSON object. Non-object values yield an empty record.
    pub fn from_json(key: TableKey, operation: Operation, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ChangeRecord::new(key, operation, fields)
    }

    /// Returns the field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// A batch of records for one key, delivered together.
pub type Batch = Vec<ChangeRecord>;
