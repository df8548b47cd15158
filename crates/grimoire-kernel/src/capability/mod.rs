//! Pluggable backend drivers.
//!
//! A [`Driver`] talks to whatever actually stores resources. The kernel wraps
//! it in a [`Capability`] and binds that at a device path such as `/dev/db`.
//! Only `query` and `put` are mandatory; the rest default to
//! [`DriverError::Unsupported`] so the recovery controller can skip the tier.

mod memory;
mod sqlite;

pub use memory::MemoryDriver;
pub use sqlite::SqliteDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::vfs::{DeviceStatus, Record, ResourceId, ResourceKind, SchemaDoc, VirtualPath};

/// Identifies a registered capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(Uuid);

impl CapabilityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CapabilityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap:{}", &self.0.simple().to_string()[..8])
    }
}

/// Lifecycle of a capability.
///
/// `Uninitialized → Mounting → Ready`, or `Mounting → Error`. An errored
/// capability moves to `Recovered` after a successful heal and back to
/// `Ready` on its next successful operation.
///
/// Detaching is the one other way out of `Ready`: `unmount`, or `remount`
/// of its device to another capability, returns it to `Uninitialized` so it
/// can be mounted again.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityState {
    #[default]
    Uninitialized,
    Mounting,
    Ready,
    Error,
    Recovered,
}

impl CapabilityState {
    /// Whether the capability may serve I/O.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ready | Self::Recovered)
    }
}

/// Errors raised by drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Backend cannot be reached at all.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The driver does not implement this operation.
    #[error("unsupported by driver: {0}")]
    Unsupported(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DriverError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Filters
// ============================================================================

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// SQL spelling.
    pub fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// One `field op value` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CmpOp,
    pub value: Value,
}

impl Condition {
    /// Parse `level<=5`, `name=Amiri`, `entity_id=3` and so on. Values that
    /// parse as JSON are taken as JSON, anything else as a string.
    ///
    /// The split happens at the first operator in the expression, so the
    /// value may itself contain operator characters (`note=a<b`).
    pub fn parse(expr: &str) -> Option<Self> {
        const OPS: [(&str, CmpOp); 6] = [
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("!=", CmpOp::Ne),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
            ("=", CmpOp::Eq),
        ];
        let (index, token, op) = OPS
            .iter()
            .filter_map(|(token, op)| expr.find(token).map(|i| (i, *token, *op)))
            .min_by_key(|(i, token, _)| (*i, Reverse(token.len())))?;
        let field = expr[..index].trim();
        let raw = expr[index + token.len()..].trim();
        if field.is_empty() {
            return None;
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Some(Self {
            field: field.to_string(),
            op,
            value,
        })
    }

    /// Evaluate against a record. Missing fields never match.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = if self.field == "id" {
            Value::String(record.id.to_string())
        } else {
            match record.fields.get(&self.field) {
                Some(v) => v.clone(),
                None => return false,
            }
        };
        let Some(ordering) = compare(&actual, &self.value) else {
            return self.op == CmpOp::Ne;
        };
        match self.op {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Numbers compare numerically (a numeric string counts as a number), strings
/// lexically, booleans by value. Anything else is incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    fn as_number(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}

/// Conjunction of conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter for a single id.
    pub fn by_id(id: &ResourceId) -> Self {
        Self::all().with("id", CmpOp::Eq, id.as_str())
    }

    pub fn with(mut self, field: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

// ============================================================================
// ioctl
// ============================================================================

/// Out-of-band device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum IoctlOp {
    /// Filtered query: `{resource, filter}` → records.
    Query,
    /// Field inventory of `resource`.
    Describe,
    /// Driver name and capability state.
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoctlRequest {
    pub resource: ResourceKind,
    #[serde(default)]
    pub filter: Filter,
}

impl IoctlRequest {
    pub fn new(resource: ResourceKind, filter: Filter) -> Self {
        Self { resource, filter }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IoctlResponse {
    Records(Vec<Record>),
    Schema(SchemaDoc),
    Status(DeviceStatus),
}

// ============================================================================
// Driver
// ============================================================================

/// Backend driver.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short name used in logs and status output.
    fn name(&self) -> &str;

    /// Native single-record lookup. `Ok(None)` means the backend answered
    /// and the record does not exist.
    async fn get_by_id(&self, kind: ResourceKind, id: &ResourceId) -> DriverResult<Option<Record>> {
        let _ = (kind, id);
        Err(DriverError::unsupported("get_by_id"))
    }

    /// Filtered query. Every driver implements this; it backs ioctl.
    async fn query(&self, kind: ResourceKind, filter: &Filter) -> DriverResult<Vec<Record>>;

    /// Native batch listing of every record of `kind`.
    async fn list(&self, kind: ResourceKind) -> DriverResult<Vec<Record>> {
        let _ = kind;
        Err(DriverError::unsupported("list"))
    }

    /// Insert or replace a record, returning what was stored.
    async fn put(&self, record: &Record) -> DriverResult<Record>;

    /// Field names known for `kind`.
    async fn describe(&self, kind: ResourceKind) -> DriverResult<SchemaDoc> {
        let _ = kind;
        Err(DriverError::unsupported("describe"))
    }

    /// Cheap reachability check used by mount and heal.
    async fn probe(&self) -> DriverResult<()> {
        Ok(())
    }
}

/// A driver registered with a kernel.
#[derive(Clone)]
pub struct Capability {
    pub id: CapabilityId,
    pub driver: Arc<dyn Driver>,
    pub mount_path: Option<VirtualPath>,
    pub state: CapabilityState,
}

impl Capability {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            id: CapabilityId::new(),
            driver,
            mount_path: None,
            state: CapabilityState::Uninitialized,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            driver: self.driver.name().to_string(),
            state: self.state.to_string(),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.id)
            .field("driver", &self.driver.name())
            .field("mount_path", &self.mount_path)
            .field("state", &self.state)
            .finish()
    }
}
