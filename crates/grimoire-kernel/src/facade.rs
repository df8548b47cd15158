//! Resource facade: the API callers outside the kernel use.
//!
//! Reads go through the recovery controller. Writes go through a descriptor
//! on the default device, then refresh the affected cache nodes.

use serde_json::{Map, Value};
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::capability::{Filter, IoctlOp, IoctlRequest, IoctlResponse};
use crate::events::KernelEvent;
use crate::kernel::Kernel;
use crate::recovery::Resolution;
use crate::seed::{SeedDocument, SeedReport};
use crate::vfs::{
    KernelError, KernelResult, Listing, OpenMode, Payload, Record, ResourceId, ResourceKind,
    SchemaDoc, VirtualPath,
};

/// High-level access to resources held by one kernel.
#[derive(Debug, Clone)]
pub struct ResourceFacade {
    kernel: Arc<Kernel>,
}

impl ResourceFacade {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Fetch one resource.
    ///
    /// Fails with `Exhausted` when no tier could answer, unless degraded
    /// reads are enabled; then the record is a flagged placeholder.
    pub async fn get_complete_resource(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> KernelResult<Resolution<Record>> {
        self.kernel.recovery().fetch(&self.kernel, kind, id).await
    }

    /// Every resource of `kind`. An unreachable backend yields an empty,
    /// degraded listing.
    pub async fn list_resources(&self, kind: ResourceKind) -> KernelResult<Resolution<Listing>> {
        self.kernel.recovery().resolve_listing(&self.kernel, kind).await
    }

    /// `sub` resources belonging to entity `id` (its effects, say).
    pub async fn get_entity_sub_resource(
        &self,
        id: &ResourceId,
        sub: ResourceKind,
    ) -> KernelResult<Resolution<Listing>> {
        self.kernel.recovery().resolve_entity_sub(&self.kernel, id, sub).await
    }

    /// Field inventory of `kind`.
    pub async fn describe(&self, kind: ResourceKind) -> KernelResult<Resolution<SchemaDoc>> {
        self.kernel.recovery().describe(&self.kernel, kind).await
    }

    /// Filtered query straight through the device. Never cached.
    pub async fn query(&self, kind: ResourceKind, filter: Filter) -> KernelResult<Vec<Record>> {
        let device = self.kernel.default_device()?;
        let guard = self.kernel.open_scoped(&device, OpenMode::Read)?;
        match guard.ioctl(IoctlOp::Query, IoctlRequest::new(kind, filter)).await? {
            IoctlResponse::Records(records) => Ok(records),
            other => Err(KernelError::integrity(
                device.as_str(),
                format!("query answered with {other:?}"),
            )),
        }
    }

    /// Merge `partial` into a resource and store it.
    ///
    /// The current record must come from a real tier; a placeholder is
    /// never written back to the backend.
    pub async fn update_resource(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        partial: &Map<String, Value>,
    ) -> KernelResult<Record> {
        let kernel = &self.kernel;
        let path = VirtualPath::for_record(kind, id)?;
        let _lock = kernel.locks().acquire(&path, "update");

        let current = kernel
            .recovery()
            .fetch_unlocked(kernel, kind, id, path.clone())
            .await?;
        if current.is_degraded() {
            return Err(KernelError::Exhausted(path.to_string()));
        }

        let mut record = current.value;
        let previous_owner = owner_of(&record);
        record.merge(partial);
        self.store(&record).await?;

        let recovery = kernel.recovery();
        recovery.write_back(kernel, &path, Payload::Record(record.clone())).await;
        self.invalidate_sets(&record);
        if let Some(previous) = previous_owner.filter(|p| owner_of(&record).as_ref() != Some(p)) {
            self.invalidate_owner(&previous, kind);
        }

        tracing::info!(%kind, id = %id, fields = partial.len(), "resource updated");
        kernel.bus().emit(KernelEvent::ResourceUpdated {
            kind,
            id: id.to_string(),
        });
        Ok(record)
    }

    /// Load a seed document through the device.
    ///
    /// With `dry_run` nothing is written; the report says what would be.
    pub async fn import_seed(&self, doc: &SeedDocument, dry_run: bool) -> KernelResult<SeedReport> {
        let (batches, skipped) = doc.batches();
        for reason in &skipped {
            tracing::warn!(reason = %reason, "seed row skipped");
        }

        let mut report = SeedReport {
            dry_run,
            skipped,
            ..SeedReport::default()
        };

        for batch in batches {
            let count = batch.records.len();
            if dry_run {
                tracing::info!(kind = %batch.kind, count, "dry run, not writing");
            } else {
                tracing::info!(kind = %batch.kind, count, "importing");
                for record in &batch.records {
                    self.store(record).await?;
                    self.invalidate_record(record);
                }
                let listing = VirtualPath::for_listing(batch.kind);
                self.kernel.recovery().invalidate(&self.kernel, &listing);
            }
            *report.imported.entry(batch.kind).or_default() += count;
            self.kernel.bus().emit(KernelEvent::SeedImported {
                kind: batch.kind,
                count,
                dry_run,
            });
        }
        Ok(report)
    }

    /// Snapshot every resource kind into a seed document, the inverse of
    /// [`import_seed`](Self::import_seed). Fails if any listing could only
    /// be served empty because the backend is unreachable.
    pub async fn export_seed(&self) -> KernelResult<SeedDocument> {
        let mut records = Vec::new();
        for kind in ResourceKind::iter() {
            let listing = self.list_resources(kind).await?;
            if listing.is_degraded() {
                return Err(KernelError::Exhausted(listing.path.to_string()));
            }
            tracing::debug!(%kind, count = listing.value.records.len(), "exported");
            records.extend(listing.value.records);
        }
        Ok(SeedDocument::from_records(records))
    }

    async fn store(&self, record: &Record) -> KernelResult<()> {
        let device = self.kernel.default_device()?;
        let guard = self.kernel.open_scoped(&device, OpenMode::Write)?;
        guard.write(Payload::Record(record.clone())).await
    }

    /// Drop cached sets the record may appear in.
    fn invalidate_sets(&self, record: &Record) {
        let recovery = self.kernel.recovery();
        recovery.invalidate(&self.kernel, &VirtualPath::for_listing(record.kind));
        if let Some(owner) = owner_of(record) {
            self.invalidate_owner(&owner, record.kind);
        }
    }

    fn invalidate_owner(&self, owner: &ResourceId, kind: ResourceKind) {
        if let Ok(path) = VirtualPath::for_entity_sub(owner, kind) {
            self.kernel.recovery().invalidate(&self.kernel, &path);
        }
    }

    /// Drop the record's own cache node and the sets it belongs to.
    fn invalidate_record(&self, record: &Record) {
        if let Ok(path) = VirtualPath::for_record(record.kind, &record.id) {
            self.kernel.recovery().invalidate(&self.kernel, &path);
        }
        self.invalidate_sets(record);
    }
}

fn owner_of(record: &Record) -> Option<ResourceId> {
    record.get("entity_id").and_then(ResourceId::from_value)
}
