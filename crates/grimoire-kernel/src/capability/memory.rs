//! In-process driver.
//!
//! Keeps records in a sorted map. Used by tests; the CLI runs an in-memory
//! SQLite store instead when no store path is configured. Call counters and
//! switches let tests observe which recovery tier was taken and simulate an
//! unreachable backend.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{Driver, DriverError, DriverResult, Filter};
use crate::vfs::{Record, ResourceId, ResourceKind, SchemaDoc};

/// Per-method call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_by_id: usize,
    pub query: usize,
    pub list: usize,
    pub put: usize,
    pub describe: usize,
    pub probe: usize,
}

impl CallCounts {
    /// Calls that reached the backend for data.
    pub fn reads(&self) -> usize {
        self.get_by_id + self.query + self.list
    }
}

#[derive(Default)]
struct Counters {
    get_by_id: AtomicUsize,
    query: AtomicUsize,
    list: AtomicUsize,
    put: AtomicUsize,
    describe: AtomicUsize,
    probe: AtomicUsize,
}

/// In-memory backend.
pub struct MemoryDriver {
    records: RwLock<BTreeMap<(ResourceKind, ResourceId), Record>>,
    calls: Counters,
    available: AtomicBool,
    native: AtomicBool,
    /// Consumed one per `get_by_id`/`query` call, front first.
    delays: Mutex<VecDeque<Duration>>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            calls: Counters::default(),
            available: AtomicBool::new(true),
            native: AtomicBool::new(true),
            delays: Mutex::new(VecDeque::new()),
        }
    }

    /// Seed with records.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let driver = Self::new();
        {
            let mut map = driver.records.write();
            for record in records {
                map.insert((record.kind, record.id.clone()), record);
            }
        }
        driver
    }

    /// Drop native `get_by_id`/`list` support so callers fall back to `query`.
    pub fn without_native(self) -> Self {
        self.native.store(false, Ordering::SeqCst);
        self
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queue artificial latencies for upcoming reads.
    pub fn push_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.delays.lock().extend(delays);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            get_by_id: self.calls.get_by_id.load(Ordering::SeqCst),
            query: self.calls.query.load(Ordering::SeqCst),
            list: self.calls.list.load(Ordering::SeqCst),
            put: self.calls.put.load(Ordering::SeqCst),
            describe: self.calls.describe.load(Ordering::SeqCst),
            probe: self.calls.probe.load(Ordering::SeqCst),
        }
    }

    /// Stored record, bypassing counters.
    pub fn stored(&self, kind: ResourceKind, id: &ResourceId) -> Option<Record> {
        self.records.read().get(&(kind, id.clone())).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> DriverResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::unavailable("memory driver switched off"))
        }
    }

    fn check_native(&self, op: &str) -> DriverResult<()> {
        if self.native.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::unsupported(op))
        }
    }

    async fn latency(&self) {
        let delay = self.delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn of_kind(&self, kind: ResourceKind) -> Vec<Record> {
        self.records
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_by_id(&self, kind: ResourceKind, id: &ResourceId) -> DriverResult<Option<Record>> {
        self.calls.get_by_id.fetch_add(1, Ordering::SeqCst);
        self.check_native("get_by_id")?;
        self.latency().await;
        self.check_available()?;
        Ok(self.stored(kind, id))
    }

    async fn query(&self, kind: ResourceKind, filter: &Filter) -> DriverResult<Vec<Record>> {
        self.calls.query.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        self.check_available()?;
        Ok(self
            .of_kind(kind)
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    async fn list(&self, kind: ResourceKind) -> DriverResult<Vec<Record>> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        self.check_native("list")?;
        self.check_available()?;
        Ok(self.of_kind(kind))
    }

    async fn put(&self, record: &Record) -> DriverResult<Record> {
        self.calls.put.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.records
            .write()
            .insert((record.kind, record.id.clone()), record.clone());
        Ok(record.clone())
    }

    async fn describe(&self, kind: ResourceKind) -> DriverResult<SchemaDoc> {
        self.calls.describe.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let records = self.of_kind(kind);
        if records.is_empty() {
            return Err(DriverError::NotFound(format!("no {kind} records to describe")));
        }
        let mut fields: BTreeSet<String> = records
            .iter()
            .flat_map(|r| r.fields.keys().cloned())
            .collect();
        fields.insert("id".to_string());
        Ok(SchemaDoc {
            kind,
            fields: fields.into_iter().collect(),
        })
    }

    async fn probe(&self) -> DriverResult<()> {
        self.calls.probe.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CmpOp;

    fn driver() -> MemoryDriver {
        MemoryDriver::with_records([
            Record::new(ResourceKind::Character, "1").with_field("level", 2),
            Record::new(ResourceKind::Character, "2").with_field("level", 9),
            Record::new(ResourceKind::Feat, "1").with_field("name", "Toughness"),
        ])
    }

    #[tokio::test]
    async fn test_get_and_query() {
        let d = driver();
        let hit = d.get_by_id(ResourceKind::Character, &"2".into()).await.unwrap();
        assert_eq!(hit.unwrap().get("level"), Some(&serde_json::json!(9)));
        assert!(d.get_by_id(ResourceKind::Character, &"3".into()).await.unwrap().is_none());

        let low = d
            .query(ResourceKind::Character, &Filter::all().with("level", CmpOp::Lt, 5))
            .await
            .unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(d.calls().reads(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_and_native_switches() {
        let d = driver().without_native();
        let err = d.get_by_id(ResourceKind::Feat, &"1".into()).await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(d.list(ResourceKind::Feat).await.unwrap_err().is_unsupported());

        d.set_available(false);
        assert!(d.query(ResourceKind::Feat, &Filter::all()).await.unwrap_err().is_unavailable());
        assert!(d.probe().await.is_err());
        d.set_available(true);
        assert!(d.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_describe() {
        let d = driver();
        let doc = d.describe(ResourceKind::Character).await.unwrap();
        assert_eq!(doc.fields, vec!["id".to_string(), "level".to_string()]);
        assert!(d.describe(ResourceKind::Skill).await.is_err());
    }
}
