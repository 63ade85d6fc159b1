//! The demo entity and its identifier.
//!
//! A record is a flat bag of JSON fields with a version number used for
//! optimistic concurrency control. Version `0` means the record has never
//! been persisted; every successful save bumps the version by one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::session::error::{SessionError, SessionResult};

/// Version number for optimistic concurrency control.
pub type Version = u64;

/// Identifier of a persisted entity.
///
/// ULID-backed so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Ulid);

impl EntityId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// raw ulid
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

impl FromStr for EntityId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(&s.to_uppercase()).map(Self)
    }
}

/// A stored entity with metadata and user fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// primary key
    pub id: EntityId,
    /// version number, `0` until first persisted
    pub version: Version,
    /// creation timestamp
    pub created_at: String,
    /// last update timestamp
    pub updated_at: String,
    /// user fields
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create an unsaved record with a generated id.
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: EntityId::generate(),
            version: 0,
            created_at: now.clone(),
            updated_at: now,
            fields,
        }
    }

    /// Create an unsaved record with a single `name` field.
    pub fn named(name: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::String(name.into()));
        Self::new(fields)
    }

    /// create a record from a JSON object
    pub fn from_value(value: Value) -> SessionResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::new(map.into_iter().collect())),
            other => Err(SessionError::InvalidRecord(format!(
                "record fields must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// get a field by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// `name` field as a string, if present
    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Value::as_str)
    }

    /// Set a field, touching the update timestamp.
    ///
    /// The version is left alone; it only moves when the record is saved.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Whether the record has been persisted at least once.
    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    /// The copy that lands in storage after a save.
    pub(crate) fn next_version(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_is_unsaved() {
        let record = Record::named("dummy");
        assert_eq!(record.version, 0);
        assert!(!record.is_persisted());
        assert_eq!(record.name(), Some("dummy"));
    }

    #[test]
    fn test_from_value_requires_object() {
        let record = Record::from_value(json!({"name": "Alice", "age": 30})).unwrap();
        assert_eq!(record.get("age"), Some(&json!(30)));

        let err = Record::from_value(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, SessionError::InvalidRecord(_)));
    }

    #[test]
    fn test_set_keeps_version() {
        let mut record = Record::named("before").next_version();
        record.set("name", "after");
        assert_eq!(record.version, 1);
        assert_eq!(record.name(), Some("after"));
    }

    #[test]
    fn test_entity_id_roundtrip_display() {
        let id = EntityId::generate();
        let text = id.to_string();
        assert_eq!(text, text.to_lowercase());
        assert_eq!(text.parse::<EntityId>().unwrap(), id);
    }

    #[test]
    fn test_record_serializes_id_as_string() {
        let record = Record::named("dummy").next_version();
        let value = serde_json::to_value(&record).unwrap();

        let id = value["id"].as_str().unwrap();
        assert!(id.eq_ignore_ascii_case(&record.id.to_string()));
        let back: Record = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, record.id);
    }
}
