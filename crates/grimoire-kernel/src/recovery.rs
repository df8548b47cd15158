//! Tiered resolution with write-back caching.
//!
//! A fetch walks the tiers in order and stops at the first success:
//!
//! 1. **Cache**: the File node at the resource's path, if its payload is
//!    structurally valid.
//! 2. **Native**: the mounted driver's own lookup (`get_by_id`, `list`,
//!    `describe`), when it implements one.
//! 3. **Ioctl**: a filtered query through a descriptor on the device.
//! 4. **Degraded**: a placeholder record (only with `degraded_reads`), or an
//!    empty listing. Schema documents are never fabricated.
//!
//! Results from tiers 2 and 3 (and degraded records) are written back to
//! the cache node. An authoritative "no such record" from the backend ends
//! the walk with `PathNotFound` instead of falling through to tier 4.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capability::{
    CapabilityState, CmpOp, Driver, DriverResult, Filter, IoctlOp, IoctlRequest, IoctlResponse,
};
use crate::events::KernelEvent;
use crate::kernel::Kernel;
use crate::vfs::{
    KernelError, KernelResult, Listing, OpenMode, PathClass, Payload, Record, ResourceId,
    ResourceKind, SchemaDoc, VirtualPath,
};

/// Where a result came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Cache = 1,
    Native = 2,
    Ioctl = 3,
    Degraded = 4,
}

impl Tier {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// A resolved value and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    pub value: T,
    pub tier: Tier,
    pub path: VirtualPath,
    pub elapsed: Duration,
}

impl<T> Resolution<T> {
    pub fn is_degraded(&self) -> bool {
        self.tier == Tier::Degraded
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        Resolution {
            value: f(self.value),
            tier: self.tier,
            path: self.path,
            elapsed: self.elapsed,
        }
    }
}

/// Outcome of a single tier.
enum Step<T> {
    Found(T),
    /// The backend answered and has nothing.
    Absent,
    /// The tier could not answer.
    Failed(String),
}

/// Tracks one walk so every exit emits the same events.
struct Walk<'k> {
    kernel: &'k Kernel,
    path: VirtualPath,
    started: Instant,
}

impl<'k> Walk<'k> {
    fn new(kernel: &'k Kernel, path: VirtualPath) -> Self {
        Self {
            kernel,
            path,
            started: Instant::now(),
        }
    }

    fn attempt(&self, tier: Tier) {
        self.kernel.bus().emit(KernelEvent::TierAttempt {
            path: self.path.to_string(),
            tier,
        });
    }

    fn failed(&self, tier: Tier, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(path = %self.path, %tier, reason = %reason, "tier failed");
        self.kernel.bus().emit(KernelEvent::TierFailed {
            path: self.path.to_string(),
            tier,
            reason,
        });
    }

    fn finish<T>(&self, value: T, tier: Tier) -> Resolution<T> {
        let elapsed = self.started.elapsed();
        tracing::debug!(path = %self.path, %tier, elapsed_ms = elapsed.as_millis() as u64, "resolved");
        let bus = self.kernel.bus();
        if tier == Tier::Degraded {
            bus.emit(KernelEvent::Degraded {
                path: self.path.to_string(),
            });
        } else {
            bus.emit(KernelEvent::Resolved {
                path: self.path.to_string(),
                tier,
            });
        }
        bus.emit(KernelEvent::LoadTiming {
            path: self.path.to_string(),
            tier,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        Resolution {
            value,
            tier,
            path: self.path.clone(),
            elapsed,
        }
    }

    fn exhausted(&self) -> KernelError {
        tracing::warn!(path = %self.path, "all recovery tiers failed");
        self.kernel.bus().emit(KernelEvent::Exhausted {
            path: self.path.to_string(),
        });
        KernelError::Exhausted(self.path.to_string())
    }

    fn not_found(&self) -> KernelError {
        KernelError::not_found(self.path.as_str())
    }
}

/// Runs the tier walk for a kernel.
#[derive(Debug, Clone)]
pub struct RecoveryController {
    degraded_reads: bool,
}

impl RecoveryController {
    pub fn new(degraded_reads: bool) -> Self {
        Self { degraded_reads }
    }

    pub fn degraded_reads(&self) -> bool {
        self.degraded_reads
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Resolve one record, holding an advisory lock on its path.
    pub async fn fetch(
        &self,
        kernel: &Kernel,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> KernelResult<Resolution<Record>> {
        let path = VirtualPath::for_record(kind, id)?;
        let _lock = kernel.locks().acquire(&path, "fetch");
        self.fetch_unlocked(kernel, kind, id, path).await
    }

    /// Resolve one record. The caller owns any lock on `path`.
    pub(crate) async fn fetch_unlocked(
        &self,
        kernel: &Kernel,
        kind: ResourceKind,
        id: &ResourceId,
        path: VirtualPath,
    ) -> KernelResult<Resolution<Record>> {
        let walk = Walk::new(kernel, path);

        walk.attempt(Tier::Cache);
        match read_cache(kernel, &walk.path, Payload::into_record, Record::is_valid) {
            Step::Found(record) => return Ok(walk.finish(record, Tier::Cache)),
            Step::Absent => walk.failed(Tier::Cache, "miss"),
            Step::Failed(reason) => walk.failed(Tier::Cache, reason),
        }

        let device = kernel.default_device()?;
        prepare_device(kernel, &device).await;

        walk.attempt(Tier::Native);
        let owned = id.clone();
        let native = native(kernel, &device, move |driver| async move {
            driver.get_by_id(kind, &owned).await
        })
        .await;
        match native {
            Step::Found(Some(record)) => {
                self.write_back(kernel, &walk.path, Payload::Record(record.clone())).await;
                return Ok(walk.finish(record, Tier::Native));
            }
            Step::Found(None) | Step::Absent => {
                walk.failed(Tier::Native, "not found");
                return Err(walk.not_found());
            }
            Step::Failed(reason) => walk.failed(Tier::Native, reason),
        }

        walk.attempt(Tier::Ioctl);
        match ioctl_query(kernel, &device, kind, Filter::by_id(id)).await {
            Step::Found(mut records) if !records.is_empty() => {
                let record = records.swap_remove(0);
                self.write_back(kernel, &walk.path, Payload::Record(record.clone())).await;
                return Ok(walk.finish(record, Tier::Ioctl));
            }
            Step::Found(_) | Step::Absent => {
                walk.failed(Tier::Ioctl, "not found");
                return Err(walk.not_found());
            }
            Step::Failed(reason) => walk.failed(Tier::Ioctl, reason),
        }

        if !self.degraded_reads {
            return Err(walk.exhausted());
        }
        tracing::warn!(path = %walk.path, "serving placeholder record");
        let placeholder = Record::placeholder(kind, id.clone());
        self.write_back(kernel, &walk.path, Payload::Record(placeholder.clone())).await;
        Ok(walk.finish(placeholder, Tier::Degraded))
    }

    // ========================================================================
    // Result sets
    // ========================================================================

    /// Resolve the listing of every `kind` record.
    pub async fn resolve_listing(
        &self,
        kernel: &Kernel,
        kind: ResourceKind,
    ) -> KernelResult<Resolution<Listing>> {
        let path = VirtualPath::for_listing(kind);
        let _lock = kernel.locks().acquire(&path, "list");
        self.resolve_set(kernel, path, kind, Filter::all()).await
    }

    /// Resolve the `sub` records that belong to entity `id`.
    pub async fn resolve_entity_sub(
        &self,
        kernel: &Kernel,
        id: &ResourceId,
        sub: ResourceKind,
    ) -> KernelResult<Resolution<Listing>> {
        let path = VirtualPath::for_entity_sub(id, sub)?;
        let _lock = kernel.locks().acquire(&path, "list");
        let filter = Filter::all().with("entity_id", CmpOp::Eq, id.as_str());
        self.resolve_set(kernel, path, sub, filter).await
    }

    async fn resolve_set(
        &self,
        kernel: &Kernel,
        path: VirtualPath,
        kind: ResourceKind,
        filter: Filter,
    ) -> KernelResult<Resolution<Listing>> {
        let walk = Walk::new(kernel, path);

        walk.attempt(Tier::Cache);
        match read_cache(kernel, &walk.path, Payload::into_listing, |l: &Listing| {
            l.kind == kind && l.records.iter().all(Record::is_valid)
        }) {
            Step::Found(listing) => return Ok(walk.finish(listing, Tier::Cache)),
            Step::Absent => walk.failed(Tier::Cache, "miss"),
            Step::Failed(reason) => walk.failed(Tier::Cache, reason),
        }

        let device = kernel.default_device()?;
        prepare_device(kernel, &device).await;

        walk.attempt(Tier::Native);
        match native(kernel, &device, move |driver| async move { driver.list(kind).await }).await {
            Step::Found(records) => {
                let records: Vec<Record> = records.into_iter().filter(|r| filter.matches(r)).collect();
                let listing = Listing::new(kind, records);
                self.write_back(kernel, &walk.path, Payload::Listing(listing.clone())).await;
                return Ok(walk.finish(listing, Tier::Native));
            }
            Step::Absent => walk.failed(Tier::Native, "not found"),
            Step::Failed(reason) => walk.failed(Tier::Native, reason),
        }

        walk.attempt(Tier::Ioctl);
        match ioctl_query(kernel, &device, kind, filter).await {
            Step::Found(records) => {
                let listing = Listing::new(kind, records);
                self.write_back(kernel, &walk.path, Payload::Listing(listing.clone())).await;
                return Ok(walk.finish(listing, Tier::Ioctl));
            }
            Step::Absent => walk.failed(Tier::Ioctl, "not found"),
            Step::Failed(reason) => walk.failed(Tier::Ioctl, reason),
        }

        // Never fabricated, never cached.
        tracing::warn!(path = %walk.path, "serving empty listing");
        Ok(walk.finish(Listing::new(kind, Vec::new()), Tier::Degraded))
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Resolve the field inventory of `kind`. Fails rather than inventing one.
    pub async fn describe(&self, kernel: &Kernel, kind: ResourceKind) -> KernelResult<Resolution<SchemaDoc>> {
        let walk = Walk::new(kernel, VirtualPath::for_schema(kind));

        walk.attempt(Tier::Cache);
        match read_cache(kernel, &walk.path, Payload::into_schema, |d: &SchemaDoc| {
            d.kind == kind && !d.fields.is_empty()
        }) {
            Step::Found(doc) => return Ok(walk.finish(doc, Tier::Cache)),
            Step::Absent => walk.failed(Tier::Cache, "miss"),
            Step::Failed(reason) => walk.failed(Tier::Cache, reason),
        }

        let device = kernel.default_device()?;
        prepare_device(kernel, &device).await;

        walk.attempt(Tier::Native);
        let mut absent = false;
        match native(kernel, &device, move |driver| async move { driver.describe(kind).await }).await {
            Step::Found(doc) => {
                self.write_back(kernel, &walk.path, Payload::Schema(doc.clone())).await;
                return Ok(walk.finish(doc, Tier::Native));
            }
            Step::Absent => {
                absent = true;
                walk.failed(Tier::Native, "not found");
            }
            Step::Failed(reason) => walk.failed(Tier::Native, reason),
        }

        if !absent {
            walk.attempt(Tier::Ioctl);
            match ioctl(kernel, &device, IoctlOp::Describe, IoctlRequest::new(kind, Filter::all())).await {
                Step::Found(IoctlResponse::Schema(doc)) => {
                    self.write_back(kernel, &walk.path, Payload::Schema(doc.clone())).await;
                    return Ok(walk.finish(doc, Tier::Ioctl));
                }
                Step::Found(_) => walk.failed(Tier::Ioctl, "unexpected ioctl response"),
                Step::Absent => absent = true,
                Step::Failed(reason) => walk.failed(Tier::Ioctl, reason),
            }
        }

        if absent {
            Err(walk.not_found())
        } else {
            Err(walk.exhausted())
        }
    }

    // ========================================================================
    // Materialization
    // ========================================================================

    /// Populate a missing resource path so it can be opened.
    pub async fn materialize(&self, kernel: &Kernel, path: &VirtualPath) -> KernelResult<()> {
        match path.classify() {
            PathClass::Record(kind, id) => {
                if VirtualPath::for_record(kind, &id)? != *path {
                    return Err(KernelError::not_found(path.as_str()));
                }
                self.fetch(kernel, kind, &id).await.map(|_| ())
            }
            PathClass::Listing(kind) => {
                let resolution = self.resolve_listing(kernel, kind).await?;
                listing_materialized(resolution)
            }
            PathClass::EntitySub(id, sub) => {
                let resolution = self.resolve_entity_sub(kernel, &id, sub).await?;
                listing_materialized(resolution)
            }
            PathClass::Schema(kind) => self.describe(kernel, kind).await.map(|_| ()),
            _ => Err(KernelError::not_found(path.as_str())),
        }
    }

    // ========================================================================
    // Cache maintenance
    // ========================================================================

    /// Store `payload` at its cache node through a write descriptor.
    /// Failures are logged and swallowed: a result is still a result when
    /// it could not be cached.
    pub(crate) async fn write_back(&self, kernel: &Kernel, path: &VirtualPath, payload: Payload) {
        match store(kernel, path, payload).await {
            Ok(()) => {
                kernel.bus().emit(KernelEvent::CacheWritten {
                    path: path.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "write-back failed");
            }
        }
    }

    /// Drop a cached node if present. Returns true if something was removed.
    pub(crate) fn invalidate(&self, kernel: &Kernel, path: &VirtualPath) -> bool {
        if kernel.tree().kind_of(path).is_some_and(|k| k.is_file()) && kernel.unlink(path).is_ok() {
            kernel.bus().emit(KernelEvent::CacheInvalidated {
                path: path.to_string(),
            });
            true
        } else {
            false
        }
    }
}

fn listing_materialized(resolution: Resolution<Listing>) -> KernelResult<()> {
    if resolution.is_degraded() {
        Err(KernelError::Exhausted(resolution.path.to_string()))
    } else {
        Ok(())
    }
}

async fn store(kernel: &Kernel, path: &VirtualPath, payload: Payload) -> KernelResult<()> {
    payload.validate_for(path)?;
    if let Some(parent) = path.parent() {
        kernel.mkdir(&parent, true)?;
    }
    let guard = kernel.open_scoped(path, OpenMode::Write)?;
    guard.write(payload).await
}

/// Tier 1. Invalid content is reported and treated as a miss.
fn read_cache<T>(
    kernel: &Kernel,
    path: &VirtualPath,
    extract: fn(Payload) -> Option<T>,
    valid: impl Fn(&T) -> bool,
) -> Step<T> {
    if !kernel.exists(path) {
        return Step::Absent;
    }
    let payload = match kernel.open_scoped(path, OpenMode::Read).and_then(|g| g.read()) {
        Ok(payload) => payload,
        Err(e) => {
            report_invalid(kernel, path, e.to_string());
            return Step::Failed(e.to_string());
        }
    };
    let kind = payload.type_name();
    match extract(payload) {
        Some(value) if valid(&value) => Step::Found(value),
        Some(_) => {
            report_invalid(kernel, path, "invalid or placeholder content".to_string());
            Step::Failed("invalid cache content".to_string())
        }
        None => {
            let reason = format!("unexpected {kind} payload");
            report_invalid(kernel, path, reason.clone());
            Step::Failed(reason)
        }
    }
}

fn report_invalid(kernel: &Kernel, path: &VirtualPath, reason: String) {
    tracing::debug!(path = %path, reason = %reason, "cache node rejected");
    kernel.bus().emit(KernelEvent::CacheInvalid {
        path: path.to_string(),
        reason,
    });
}

/// Give an errored capability one chance to heal before the backend tiers.
async fn prepare_device(kernel: &Kernel, device: &VirtualPath) {
    if kernel.capability_state(device) == Some(CapabilityState::Error) {
        if let Err(e) = kernel.heal(device).await {
            tracing::warn!(device = %device, error = %e, "heal before fetch failed");
        }
    }
}

/// Tier 2: call the driver directly.
async fn native<T, F, Fut>(kernel: &Kernel, device: &VirtualPath, call: F) -> Step<T>
where
    F: FnOnce(Arc<dyn Driver>) -> Fut,
    Fut: Future<Output = DriverResult<T>>,
{
    match kernel.call_driver(device, call).await {
        Ok(value) => Step::Found(value),
        Err(e) => classify_error(e),
    }
}

/// Tier 3: go through a device descriptor.
async fn ioctl(kernel: &Kernel, device: &VirtualPath, op: IoctlOp, request: IoctlRequest) -> Step<IoctlResponse> {
    let guard = match kernel.open_scoped(device, OpenMode::Read) {
        Ok(guard) => guard,
        Err(e) => return Step::Failed(e.to_string()),
    };
    match guard.ioctl(op, request).await {
        Ok(response) => Step::Found(response),
        Err(e) => classify_error(e),
    }
}

async fn ioctl_query(kernel: &Kernel, device: &VirtualPath, kind: ResourceKind, filter: Filter) -> Step<Vec<Record>> {
    match ioctl(kernel, device, IoctlOp::Query, IoctlRequest::new(kind, filter)).await {
        Step::Found(IoctlResponse::Records(records)) => Step::Found(records),
        Step::Found(_) => Step::Failed("unexpected ioctl response".to_string()),
        Step::Absent => Step::Absent,
        Step::Failed(reason) => Step::Failed(reason),
    }
}

fn classify_error<T>(e: KernelError) -> Step<T> {
    match e {
        KernelError::Io(crate::capability::DriverError::NotFound(_)) => Step::Absent,
        other => Step::Failed(other.to_string()),
    }
}
