//! Typed node content.
//!
//! File nodes never hold untyped bytes. Each payload variant is validated
//! against the path it is stored under (see [`Payload::validate_for`]), so a
//! character record cannot land in a feat listing and a lock sentinel cannot
//! hold resource data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{KernelError, KernelResult};
use super::path::{PathClass, VirtualPath};

/// Kind of resource served by the kernel. Doubles as the backing table name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Character,
    Entity,
    Ability,
    Skill,
    Class,
    Ancestry,
    Feat,
    Trait,
    Effect,
    Equipment,
}

/// Resource identifier. Numeric database keys are carried as their decimal
/// string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract an id from a JSON value (string or integer).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for ResourceId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A single resource record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: ResourceKind,
    pub id: ResourceId,
    /// Set only on placeholder records fabricated by the degraded tier.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    /// Remaining columns, `id` excluded.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(kind: ResourceKind, id: impl Into<ResourceId>) -> Self {
        Self {
            kind,
            id: id.into(),
            synthetic: false,
            fields: Map::new(),
        }
    }

    /// Set a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Build a record from a flat JSON object carrying an `id` member.
    pub fn from_json(kind: ResourceKind, value: Value) -> KernelResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(KernelError::integrity(kind.to_string(), "record is not an object"));
        };
        let id = fields
            .remove("id")
            .as_ref()
            .and_then(ResourceId::from_value)
            .ok_or_else(|| KernelError::integrity(kind.to_string(), "record has no id"))?;
        Ok(Self {
            kind,
            id,
            synthetic: false,
            fields,
        })
    }

    /// Flatten back into a JSON object with `id` restored.
    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.0.clone()));
        Value::Object(object)
    }

    /// Minimal fabricated record for a completely unavailable backend.
    pub fn placeholder(kind: ResourceKind, id: ResourceId) -> Self {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(format!("Unavailable {kind} {id}")));
        Self {
            kind,
            id,
            synthetic: true,
            fields,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        if key == "id" {
            return None;
        }
        self.fields.get(key)
    }

    /// Apply a JSON merge patch (RFC 7396) to the fields. `null` removes a key;
    /// nested objects merge recursively. The id is never patched.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            merge_value(&mut self.fields, key, value);
        }
    }

    /// Structural validity: non-empty id, real data.
    pub fn is_valid(&self) -> bool {
        !self.id.as_str().is_empty() && !self.synthetic
    }
}

fn merge_value(target: &mut Map<String, Value>, key: &str, patch: &Value) {
    match patch {
        Value::Null => {
            target.remove(key);
        }
        Value::Object(patch_obj) => {
            let entry = target
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(existing) = entry {
                for (k, v) in patch_obj {
                    merge_value(existing, k, v);
                }
            }
        }
        other => {
            target.insert(key.to_string(), other.clone());
        }
    }
}

/// Cached result set: a listing of one kind, or an entity sub-resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub kind: ResourceKind,
    pub records: Vec<Record>,
}

impl Listing {
    pub fn new(kind: ResourceKind, records: Vec<Record>) -> Self {
        Self { kind, records }
    }

    pub fn ids(&self) -> Vec<&ResourceId> {
        self.records.iter().map(|r| &r.id).collect()
    }
}

/// Field inventory of a resource kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub kind: ResourceKind,
    pub fields: Vec<String>,
}

/// Content of an advisory lock sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Token of the operation that created the lock.
    pub owner: String,
    /// What the owner is doing (e.g. `fetch`, `update`).
    pub operation: String,
}

impl LockInfo {
    pub fn new(owner: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            created_at: unix_millis(SystemTime::now()),
            owner: owner.into(),
            operation: operation.into(),
        }
    }
}

/// What a read on a device descriptor returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub driver: String,
    pub state: String,
}

/// Content of a File node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Record(Record),
    Listing(Listing),
    Schema(SchemaDoc),
    Lock(LockInfo),
    Status(DeviceStatus),
    /// Free-form document for paths outside the resource scheme.
    Document(Value),
}

impl Payload {
    /// Short name of the variant, for errors and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Record(_) => "record",
            Payload::Listing(_) => "listing",
            Payload::Schema(_) => "schema",
            Payload::Lock(_) => "lock",
            Payload::Status(_) => "status",
            Payload::Document(_) => "document",
        }
    }

    /// Check that this payload may be stored at `path`.
    pub fn validate_for(&self, path: &VirtualPath) -> KernelResult<()> {
        let class = path.classify();
        let ok = match (&class, self) {
            (PathClass::Device(_), _) => {
                return Err(KernelError::type_mismatch(path.as_str(), "file", "device"));
            }
            (PathClass::Lock, Payload::Lock(_)) => true,
            (PathClass::Lock, _) => false,
            (PathClass::Record(kind, id), Payload::Record(record)) => {
                if record.id.as_str().is_empty() {
                    return Err(KernelError::integrity(path.as_str(), "record has an empty id"));
                }
                record.kind == *kind && record.id == *id
            }
            (PathClass::Listing(kind), Payload::Listing(listing)) => listing.kind == *kind,
            (PathClass::EntitySub(_, sub), Payload::Listing(listing)) => listing.kind == *sub,
            (PathClass::Schema(kind), Payload::Schema(doc)) => doc.kind == *kind,
            (PathClass::Plain, _) => true,
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(KernelError::integrity(
                path.as_str(),
                format!("{} payload does not belong at this path", self.type_name()),
            ))
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Payload::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_listing(self) -> Option<Listing> {
        match self {
            Payload::Listing(listing) => Some(listing),
            _ => None,
        }
    }

    pub fn into_schema(self) -> Option<SchemaDoc> {
        match self {
            Payload::Schema(doc) => Some(doc),
            _ => None,
        }
    }
}

pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[test]
    fn test_record_from_json_numeric_id() {
        let record = Record::from_json(
            ResourceKind::Character,
            json!({"id": 42, "name": "Seelah", "level": 5}),
        )
        .unwrap();
        assert_eq!(record.id.as_str(), "42");
        assert_eq!(record.get("level"), Some(&json!(5)));
        assert!(record.get("id").is_none());
        assert_eq!(record.to_json()["id"], json!("42"));
    }

    #[test]
    fn test_record_from_json_requires_id() {
        let err = Record::from_json(ResourceKind::Feat, json!({"name": "Power Attack"})).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DataIntegrity);
    }

    #[test]
    fn test_merge_patch() {
        let mut record = Record::from_json(
            ResourceKind::Character,
            json!({"id": 1, "name": "Amiri", "hp": {"max": 30, "current": 12}, "notes": "x"}),
        )
        .unwrap();

        let patch = json!({"id": 99, "hp": {"current": 30}, "notes": null, "level": 3});
        record.merge(patch.as_object().unwrap());

        assert_eq!(record.id.as_str(), "1");
        assert_eq!(record.get("hp"), Some(&json!({"max": 30, "current": 30})));
        assert!(record.get("notes").is_none());
        assert_eq!(record.get("level"), Some(&json!(3)));
    }

    #[test]
    fn test_placeholder_is_flagged() {
        let record = Record::placeholder(ResourceKind::Character, ResourceId::new("7"));
        assert!(record.synthetic);
        assert!(!record.is_valid());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["synthetic"], json!(true));

        let real = serde_json::to_value(Record::new(ResourceKind::Character, "7")).unwrap();
        assert!(real.get("synthetic").is_none());
    }

    #[test]
    fn test_validate_for_path() {
        let record = Payload::Record(Record::new(ResourceKind::Character, "42"));
        assert!(record.validate_for(&p("/proc/character/42")).is_ok());
        assert!(record.validate_for(&p("/proc/character/43")).is_err());
        assert!(record.validate_for(&p("/proc/feat/42")).is_err());
        assert!(record.validate_for(&p("/notes/anything")).is_ok());
        assert!(record.validate_for(&p("/proc/character/42.lock")).is_err());

        let lock = Payload::Lock(LockInfo::new("op", "fetch"));
        assert!(lock.validate_for(&p("/proc/character/42.lock")).is_ok());

        let listing = Payload::Listing(Listing::new(ResourceKind::Effect, vec![]));
        assert!(listing.validate_for(&p("/entity/3/effect")).is_ok());
        assert!(listing.validate_for(&p("/proc/feat/list")).is_err());

        assert_eq!(
            record.validate_for(&p("/dev/db")).unwrap_err().kind(),
            crate::ErrorKind::TypeMismatch
        );
    }
}
