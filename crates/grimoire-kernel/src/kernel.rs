//! The Kernel: owner of one virtual namespace.
//!
//! A kernel owns:
//! - A node tree (directories, cached files, device nodes)
//! - A descriptor table
//! - An event bus and a lock manager on top of the tree
//! - The registered capabilities and their lifecycle state
//!
//! Instances share nothing. Everything that used to be ambient process state
//! hangs off a `Kernel` that callers hold in an `Arc`.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::capability::{
    Capability, CapabilityId, CapabilityState, Driver, DriverResult, IoctlOp, IoctlRequest,
    IoctlResponse,
};
use crate::config::KernelConfig;
use crate::events::{EventBus, KernelEvent};
use crate::lock::LockManager;
use crate::recovery::RecoveryController;
use crate::retry::RetryPolicy;
use crate::vfs::{
    DirEntry, Fd, FdTable, FdTarget, KernelError, KernelResult, MkdirOutcome, NodeKind, NodeTree,
    OpenMode, PathClass, Payload, ResourceKind, Stat, VirtualPath,
};

/// Directories every mounted kernel is expected to have.
pub fn critical_dirs() -> Vec<VirtualPath> {
    let mut dirs = vec![
        VirtualPath::from_static("/dev"),
        VirtualPath::from_static("/proc"),
        VirtualPath::from_static("/entity"),
        VirtualPath::from_static("/etc/schema"),
    ];
    dirs.extend(
        ResourceKind::iter()
            .filter(|k| *k != ResourceKind::Entity)
            .filter_map(|k| VirtualPath::for_listing(k).parent()),
    );
    dirs
}

/// The virtual resource-access kernel.
pub struct Kernel {
    tree: Arc<NodeTree>,
    fds: FdTable,
    bus: EventBus,
    locks: LockManager,
    capabilities: DashMap<CapabilityId, Capability>,
    recovery: RecoveryController,
    retry: RetryPolicy,
    config: KernelConfig,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("nodes", &self.tree.len())
            .field("open_fds", &self.fds.len())
            .field("capabilities", &self.capabilities.len())
            .field("bus", &self.bus)
            .finish()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let tree = Arc::new(NodeTree::new());
        let bus = EventBus::new(config.kernel.event_capacity);
        let locks = LockManager::new(Arc::clone(&tree), bus.clone(), config.kernel.lock_owner.clone());
        Self {
            tree,
            fds: FdTable::new(),
            bus,
            locks,
            capabilities: DashMap::new(),
            recovery: RecoveryController::new(config.kernel.degraded_reads),
            retry: config.retry.policy(),
            config,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Device path of the configured default capability.
    pub fn default_device(&self) -> KernelResult<VirtualPath> {
        VirtualPath::parse(&self.config.kernel.device)
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    pub fn exists(&self, path: &VirtualPath) -> bool {
        self.tree.exists(path)
    }

    pub fn stat(&self, path: &VirtualPath) -> Option<Stat> {
        self.tree.stat(path)
    }

    pub fn readdir(&self, path: &VirtualPath) -> KernelResult<Vec<DirEntry>> {
        self.tree.readdir(path)
    }

    /// Create a directory. File nodes in the way are replaced and reported
    /// as `node.replaced`.
    pub fn mkdir(&self, path: &VirtualPath, recursive: bool) -> KernelResult<MkdirOutcome> {
        let outcome = self.tree.mkdir(path, recursive)?;
        self.report_replaced(&outcome);
        Ok(outcome)
    }

    /// Create or overwrite a file, creating ancestors.
    pub fn create(&self, path: &VirtualPath, payload: Payload) -> KernelResult<()> {
        let outcome = self.tree.create(path, payload)?;
        self.report_replaced(&outcome);
        Ok(())
    }

    pub fn unlink(&self, path: &VirtualPath) -> KernelResult<()> {
        self.tree.unlink(path)
    }

    pub fn rmdir(&self, path: &VirtualPath) -> KernelResult<()> {
        self.tree.rmdir(path)
    }

    fn report_replaced(&self, outcome: &MkdirOutcome) {
        for path in &outcome.replaced {
            self.bus.emit(KernelEvent::NodeReplaced {
                path: path.to_string(),
            });
        }
    }

    /// Create any missing critical directory.
    pub fn ensure_critical_dirs(&self) -> KernelResult<MkdirOutcome> {
        let mut total = MkdirOutcome::default();
        for dir in critical_dirs() {
            let outcome = self.mkdir(&dir, true)?;
            total.created.extend(outcome.created);
            total.replaced.extend(outcome.replaced);
        }
        if !total.is_noop() {
            tracing::info!(
                created = total.created.len(),
                replaced = total.replaced.len(),
                "critical directories repaired"
            );
        }
        Ok(total)
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Register a driver. It is unreachable until mounted.
    pub fn register_capability(&self, driver: Arc<dyn Driver>) -> CapabilityId {
        let capability = Capability::new(driver);
        let id = capability.id;
        tracing::debug!(capability = %id, driver = capability.driver.name(), "capability registered");
        self.capabilities.insert(id, capability);
        id
    }

    pub fn capability(&self, id: CapabilityId) -> Option<Capability> {
        self.capabilities.get(&id).map(|c| c.clone())
    }

    /// Every registered capability, mounted ones first by path.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut all: Vec<Capability> = self.capabilities.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| {
            (a.mount_path.is_none(), &a.mount_path).cmp(&(b.mount_path.is_none(), &b.mount_path))
        });
        all
    }

    /// Capability bound at a device path.
    pub fn capability_at(&self, device: &VirtualPath) -> KernelResult<Capability> {
        let id = self
            .tree
            .device_at(device)
            .ok_or_else(|| KernelError::not_found(device.as_str()))?;
        self.capability(id)
            .ok_or_else(|| KernelError::unavailable(format!("{device} is bound to an unknown capability")))
    }

    pub fn capability_state(&self, device: &VirtualPath) -> Option<CapabilityState> {
        self.capability_at(device).ok().map(|c| c.state)
    }

    fn set_state(&self, id: CapabilityId, to: CapabilityState) {
        let (from, device) = {
            let Some(mut cap) = self.capabilities.get_mut(&id) else {
                return;
            };
            let from = std::mem::replace(&mut cap.state, to);
            let device = cap
                .mount_path
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            (from, device)
        };
        if from == to {
            return;
        }
        match to {
            CapabilityState::Error => {
                tracing::warn!(capability = %id, device = %device, %from, "capability entered error state")
            }
            _ => tracing::info!(capability = %id, device = %device, %from, %to, "capability state changed"),
        }
        self.bus.emit(KernelEvent::CapabilityState {
            capability: id,
            device,
            from,
            to,
        });
    }

    /// Track a driver result against its capability's lifecycle.
    pub(crate) fn observe<T>(&self, id: CapabilityId, result: DriverResult<T>) -> KernelResult<T> {
        match result {
            Ok(value) => {
                if self.capability(id).map(|c| c.state) == Some(CapabilityState::Recovered) {
                    self.set_state(id, CapabilityState::Ready);
                }
                Ok(value)
            }
            Err(e) => {
                if e.is_unavailable() {
                    self.set_state(id, CapabilityState::Error);
                }
                Err(e.into())
            }
        }
    }

    /// Bind a registered capability at a device path.
    ///
    /// A path that already holds a device is refused with `AlreadyMounted`;
    /// use [`Kernel::remount`] to replace it. The device node stays bound
    /// when the driver probe fails, with the capability in `Error`, so a
    /// later [`Kernel::heal`] can bring it back.
    pub async fn mount(&self, device: &VirtualPath, id: CapabilityId) -> KernelResult<()> {
        if !matches!(device.classify(), PathClass::Device(_)) {
            return Err(KernelError::invalid_path(format!("{device} is not under /dev")));
        }
        let capability = self
            .capability(id)
            .ok_or_else(|| KernelError::not_found(id.to_string()))?;
        if let Some(existing) = &capability.mount_path {
            return Err(KernelError::AlreadyMounted(format!("{id} is already mounted at {existing}")));
        }

        self.tree.bind_device(device, id)?;
        if let Some(mut cap) = self.capabilities.get_mut(&id) {
            cap.mount_path = Some(device.clone());
        }
        self.bring_up(device, id, &capability).await
    }

    async fn bring_up(&self, device: &VirtualPath, id: CapabilityId, capability: &Capability) -> KernelResult<()> {
        self.set_state(id, CapabilityState::Mounting);

        let driver = Arc::clone(&capability.driver);
        let result = self
            .retry
            .retry("mount", Some(&self.bus), || {
                let driver = Arc::clone(&driver);
                async move {
                    driver.probe().await.map_err(KernelError::from)?;
                    self.ensure_critical_dirs()
                }
            })
            .await;

        match result {
            Ok(_) => {
                self.set_state(id, CapabilityState::Ready);
                tracing::info!(device = %device, driver = capability.driver.name(), "mounted");
                Ok(())
            }
            Err(e) => {
                self.set_state(id, CapabilityState::Error);
                Err(e)
            }
        }
    }

    /// Replace whatever is mounted at `device` with another capability.
    /// Returns the previous capability, now unmounted and `Uninitialized`.
    pub async fn remount(&self, device: &VirtualPath, id: CapabilityId) -> KernelResult<CapabilityId> {
        let capability = self
            .capability(id)
            .ok_or_else(|| KernelError::not_found(id.to_string()))?;
        if capability.mount_path.is_some() {
            return Err(KernelError::AlreadyMounted(format!("{id} is already mounted")));
        }

        let previous = self.tree.rebind_device(device, id)?;
        if let Some(mut old) = self.capabilities.get_mut(&previous) {
            old.mount_path = None;
        }
        self.set_state(previous, CapabilityState::Uninitialized);
        if let Some(mut cap) = self.capabilities.get_mut(&id) {
            cap.mount_path = Some(device.clone());
        }

        tracing::info!(device = %device, %previous, current = %id, "capability replaced");
        self.bus.emit(KernelEvent::CapabilityReplaced {
            device: device.to_string(),
            previous,
            current: id,
        });
        self.bring_up(device, id, &capability).await?;
        Ok(previous)
    }

    /// Remove the device node at `device`. Its capability goes back to
    /// `Uninitialized`.
    pub fn unmount(&self, device: &VirtualPath) -> KernelResult<CapabilityId> {
        let id = self.tree.unbind_device(device)?;
        self.set_state(id, CapabilityState::Uninitialized);
        if let Some(mut cap) = self.capabilities.get_mut(&id) {
            cap.mount_path = None;
        }
        tracing::info!(device = %device, capability = %id, "unmounted");
        Ok(id)
    }

    /// Repair critical directories and re-probe the driver at `device`.
    ///
    /// An `Error` capability that passes moves to `Recovered`; its next
    /// successful operation promotes it to `Ready`.
    pub async fn heal(&self, device: &VirtualPath) -> KernelResult<CapabilityState> {
        let capability = self.capability_at(device)?;
        let driver = Arc::clone(&capability.driver);

        self.retry
            .retry("heal", Some(&self.bus), || {
                let driver = Arc::clone(&driver);
                async move {
                    self.ensure_critical_dirs()?;
                    driver.probe().await.map_err(KernelError::from)
                }
            })
            .await?;

        let next = match capability.state {
            CapabilityState::Error | CapabilityState::Mounting => CapabilityState::Recovered,
            other => other,
        };
        self.set_state(capability.id, next);
        Ok(next)
    }

    fn usable(&self, id: CapabilityId, path: &VirtualPath) -> KernelResult<Capability> {
        let capability = self
            .capability(id)
            .ok_or_else(|| KernelError::unavailable(format!("{path}: capability gone")))?;
        if !capability.state.is_usable() {
            return Err(KernelError::unavailable(format!(
                "{path}: capability is {}",
                capability.state
            )));
        }
        Ok(capability)
    }

    /// Call the driver mounted at `device` directly, tracking its state.
    pub(crate) async fn call_driver<T, F, Fut>(&self, device: &VirtualPath, call: F) -> KernelResult<T>
    where
        F: FnOnce(Arc<dyn Driver>) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let id = self.capability_at(device)?.id;
        let capability = self.usable(id, device)?;
        let result = call(Arc::clone(&capability.driver)).await;
        self.observe(id, result)
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Open `path`.
    ///
    /// A readable open of a missing resource path (`/proc/<kind>/<id>`,
    /// listings, entity sub-resources, schema documents) materializes it
    /// through the recovery controller first. A write-only open of a
    /// missing path creates an empty file under an existing directory.
    pub async fn open(&self, path: &VirtualPath, mode: OpenMode) -> KernelResult<Fd> {
        if mode.readable() && !self.tree.exists(path) {
            self.recovery.materialize(self, path).await?;
        }
        self.open_existing(path, mode)
    }

    /// Open without materializing anything.
    pub fn open_existing(&self, path: &VirtualPath, mode: OpenMode) -> KernelResult<Fd> {
        match self.tree.kind_of(path) {
            Some(NodeKind::Device) => {
                let id = self
                    .tree
                    .device_at(path)
                    .ok_or_else(|| KernelError::not_found(path.as_str()))?;
                Ok(self.fds.open(path.clone(), mode, FdTarget::Device(id)))
            }
            Some(NodeKind::File) => Ok(self.fds.open(path.clone(), mode, FdTarget::File)),
            Some(NodeKind::Directory) => {
                Err(KernelError::type_mismatch(path.as_str(), "file", "directory"))
            }
            None if mode.writable() && !mode.readable() => {
                self.tree.touch(path)?;
                Ok(self.fds.open(path.clone(), mode, FdTarget::File))
            }
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Open and wrap the descriptor in a guard that closes it on drop.
    pub fn open_scoped(&self, path: &VirtualPath, mode: OpenMode) -> KernelResult<FdGuard<'_>> {
        let fd = self.open_existing(path, mode)?;
        Ok(FdGuard::new(self, fd))
    }

    /// Like [`Kernel::open_scoped`], materializing missing resources.
    pub async fn open_guarded(&self, path: &VirtualPath, mode: OpenMode) -> KernelResult<FdGuard<'_>> {
        let fd = self.open(path, mode).await?;
        Ok(FdGuard::new(self, fd))
    }

    /// Read a descriptor. Devices report their status.
    pub fn read(&self, fd: Fd) -> KernelResult<Payload> {
        let descriptor = self.fds.get(fd)?;
        if !descriptor.mode.readable() {
            return Err(KernelError::permission_denied(format!("{fd} not open for reading")));
        }
        match descriptor.target {
            FdTarget::File => self.tree.read(&descriptor.path),
            FdTarget::Device(id) => {
                let capability = self
                    .capability(id)
                    .ok_or_else(|| KernelError::unavailable(descriptor.path.to_string()))?;
                Ok(Payload::Status(capability.status()))
            }
        }
    }

    /// Write a descriptor. A record written to a device is stored through
    /// its driver.
    pub async fn write(&self, fd: Fd, payload: Payload) -> KernelResult<()> {
        let descriptor = self.fds.get(fd)?;
        if !descriptor.mode.writable() {
            return Err(KernelError::permission_denied(format!("{fd} not open for writing")));
        }
        match descriptor.target {
            FdTarget::File => self.tree.write(&descriptor.path, payload),
            FdTarget::Device(id) => {
                let Payload::Record(record) = payload else {
                    return Err(KernelError::integrity(
                        descriptor.path.as_str(),
                        format!("devices accept records, not {}", payload.type_name()),
                    ));
                };
                if !record.is_valid() {
                    return Err(KernelError::integrity(
                        descriptor.path.as_str(),
                        "refusing to store a placeholder record",
                    ));
                }
                let capability = self.usable(id, &descriptor.path)?;
                let result = capability.driver.put(&record).await;
                self.observe(id, result).map(|_| ())
            }
        }
    }

    /// Out-of-band device request.
    pub async fn ioctl(&self, fd: Fd, op: IoctlOp, request: IoctlRequest) -> KernelResult<IoctlResponse> {
        let descriptor = self.fds.get(fd)?;
        let FdTarget::Device(id) = descriptor.target else {
            return Err(KernelError::type_mismatch(descriptor.path.as_str(), "device", "file"));
        };

        tracing::debug!(path = %descriptor.path, %op, resource = %request.resource, "ioctl");
        match op {
            IoctlOp::Status => {
                let capability = self
                    .capability(id)
                    .ok_or_else(|| KernelError::unavailable(descriptor.path.to_string()))?;
                Ok(IoctlResponse::Status(capability.status()))
            }
            IoctlOp::Query => {
                let capability = self.usable(id, &descriptor.path)?;
                let result = capability.driver.query(request.resource, &request.filter).await;
                self.observe(id, result).map(IoctlResponse::Records)
            }
            IoctlOp::Describe => {
                let capability = self.usable(id, &descriptor.path)?;
                let result = capability.driver.describe(request.resource).await;
                self.observe(id, result).map(IoctlResponse::Schema)
            }
        }
    }

    /// Release a descriptor. Closing twice is reported, never fatal.
    pub fn close(&self, fd: Fd) -> bool {
        let closed = self.fds.close(fd);
        if !closed {
            self.bus.emit(KernelEvent::DoubleClose { fd: fd.raw() });
        }
        closed
    }
}

/// A descriptor that closes itself.
#[derive(Debug)]
pub struct FdGuard<'a> {
    kernel: &'a Kernel,
    fd: Fd,
    closed: bool,
}

impl<'a> FdGuard<'a> {
    fn new(kernel: &'a Kernel, fd: Fd) -> Self {
        Self {
            kernel,
            fd,
            closed: false,
        }
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn read(&self) -> KernelResult<Payload> {
        self.kernel.read(self.fd)
    }

    pub async fn write(&self, payload: Payload) -> KernelResult<()> {
        self.kernel.write(self.fd, payload).await
    }

    pub async fn ioctl(&self, op: IoctlOp, request: IoctlRequest) -> KernelResult<IoctlResponse> {
        self.kernel.ioctl(self.fd, op, request).await
    }

    /// Close now instead of at drop.
    pub fn close(mut self) -> bool {
        self.closed = true;
        self.kernel.close(self.fd)
    }
}

impl Drop for FdGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.kernel.close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Filter, MemoryDriver};
    use crate::events::EventLog;
    use crate::vfs::{ErrorKind, Record};
    use serde_json::json;

    fn p(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    fn fast_config() -> KernelConfig {
        KernelConfig::default().with_retry(
            &RetryPolicy::default()
                .with_max_attempts(2)
                .with_initial_delay(std::time::Duration::from_millis(1)),
        )
    }

    async fn mounted(driver: Arc<MemoryDriver>) -> Kernel {
        let kernel = Kernel::new(fast_config());
        let id = kernel.register_capability(driver);
        kernel.mount(&p("/dev/db"), id).await.unwrap();
        kernel
    }

    #[test]
    fn test_create_open_read_roundtrip() {
        let kernel = Kernel::default();
        let payload = Payload::Document(json!({"motd": "hello"}));
        kernel.create(&p("/etc/motd"), payload.clone()).unwrap();

        let guard = kernel.open_scoped(&p("/etc/motd"), OpenMode::Read).unwrap();
        assert_eq!(guard.read().unwrap(), payload);
        drop(guard);
        assert!(kernel.fds().is_empty());
    }

    #[test]
    fn test_mode_enforced() {
        let kernel = Kernel::default();
        kernel.create(&p("/etc/motd"), Payload::Document(json!(1))).unwrap();
        let fd = kernel.open_existing(&p("/etc/motd"), OpenMode::Write).unwrap();
        assert_eq!(kernel.read(fd).unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert!(kernel.close(fd));
    }

    #[test]
    fn test_open_directory_is_type_mismatch() {
        let kernel = Kernel::default();
        kernel.mkdir(&p("/a"), true).unwrap();
        assert_eq!(
            kernel.open_existing(&p("/a"), OpenMode::Read).unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn test_write_only_open_creates_file() {
        let kernel = Kernel::default();
        kernel.mkdir(&p("/tmp"), true).unwrap();
        let fd = kernel.open_existing(&p("/tmp/new"), OpenMode::Write).unwrap();
        assert!(kernel.exists(&p("/tmp/new")));
        kernel.close(fd);
        assert_eq!(
            kernel.open_existing(&p("/tmp/none"), OpenMode::Read).unwrap_err().kind(),
            ErrorKind::PathNotFound
        );
    }

    #[test]
    fn test_double_close_emits_event() {
        let kernel = Kernel::default();
        let log = EventLog::attach(kernel.bus(), "fd.*");
        kernel.create(&p("/x"), Payload::Document(json!(0))).unwrap();
        let fd = kernel.open_existing(&p("/x"), OpenMode::Read).unwrap();
        assert!(kernel.close(fd));
        assert!(!kernel.close(fd));
        assert_eq!(log.count("fd.double_close"), 1);
        assert_eq!(kernel.fds().stale_closes(), 1);
    }

    #[test]
    fn test_guard_close_then_drop_closes_once() {
        let kernel = Kernel::default();
        let log = EventLog::attach(kernel.bus(), "fd.*");
        kernel.create(&p("/x"), Payload::Document(json!(0))).unwrap();
        let guard = kernel.open_scoped(&p("/x"), OpenMode::Read).unwrap();
        assert!(guard.close());
        assert!(kernel.fds().is_empty());
        assert_eq!(log.count("fd.double_close"), 0);
    }

    #[test]
    fn test_mkdir_over_file_emits_replaced() {
        let kernel = Kernel::default();
        let log = EventLog::attach(kernel.bus(), "node.*");
        kernel.create(&p("/proc"), Payload::Document(json!("oops"))).unwrap();
        kernel.ensure_critical_dirs().unwrap();
        assert!(kernel.stat(&p("/proc")).unwrap().is_directory());
        assert!(kernel.exists(&p("/proc/character")));
        assert_eq!(log.count("node.replaced"), 1);
    }

    #[tokio::test]
    async fn test_mount_lifecycle_events() {
        let kernel = Kernel::new(fast_config());
        let log = EventLog::attach(kernel.bus(), "capability.*");
        let id = kernel.register_capability(Arc::new(MemoryDriver::new()));
        kernel.mount(&p("/dev/db"), id).await.unwrap();

        assert_eq!(log.subjects(), vec!["capability.mounting", "capability.ready"]);
        assert_eq!(kernel.capability_state(&p("/dev/db")), Some(CapabilityState::Ready));
        for dir in critical_dirs() {
            assert!(kernel.stat(&dir).unwrap().is_directory(), "{dir}");
        }
    }

    #[tokio::test]
    async fn test_mount_outside_dev_rejected() {
        let kernel = Kernel::default();
        let id = kernel.register_capability(Arc::new(MemoryDriver::new()));
        let err = kernel.mount(&p("/proc/db"), id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }

    #[tokio::test]
    async fn test_second_mount_rejected_remount_replaces() {
        let first = Arc::new(MemoryDriver::new());
        let kernel = mounted(Arc::clone(&first)).await;
        let original = kernel.capability_at(&p("/dev/db")).unwrap().id;

        let second = kernel.register_capability(Arc::new(MemoryDriver::new()));
        let err = kernel.mount(&p("/dev/db"), second).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyMounted);
        assert_eq!(kernel.capability_at(&p("/dev/db")).unwrap().id, original);
        assert_eq!(kernel.capability(second).unwrap().state, CapabilityState::Uninitialized);

        let log = EventLog::attach(kernel.bus(), "capability.replaced");
        assert_eq!(kernel.remount(&p("/dev/db"), second).await.unwrap(), original);
        assert_eq!(kernel.capability_at(&p("/dev/db")).unwrap().id, second);
        assert_eq!(kernel.capability(original).unwrap().mount_path, None);
        assert_eq!(log.count("capability.replaced"), 1);

        // The detached capability leaves Ready and can be mounted elsewhere.
        assert_eq!(kernel.capability(original).unwrap().state, CapabilityState::Uninitialized);
        kernel.mount(&p("/dev/spare"), original).await.unwrap();
        assert_eq!(kernel.capability_state(&p("/dev/spare")), Some(CapabilityState::Ready));
    }

    #[tokio::test]
    async fn test_failed_mount_then_heal() {
        let driver = Arc::new(MemoryDriver::new());
        driver.set_available(false);
        let kernel = Kernel::new(fast_config());
        let id = kernel.register_capability(driver.clone());

        let err = kernel.mount(&p("/dev/db"), id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(kernel.capability_state(&p("/dev/db")), Some(CapabilityState::Error));
        assert!(kernel.heal(&p("/dev/db")).await.is_err());

        driver.set_available(true);
        assert_eq!(kernel.heal(&p("/dev/db")).await.unwrap(), CapabilityState::Recovered);
    }

    #[tokio::test]
    async fn test_device_io() {
        let driver = Arc::new(MemoryDriver::new());
        let kernel = mounted(Arc::clone(&driver)).await;

        let dev = kernel.open_scoped(&p("/dev/db"), OpenMode::ReadWrite).unwrap();
        let record = Record::new(ResourceKind::Feat, "5").with_field("name", "Dodge");
        dev.write(Payload::Record(record.clone())).await.unwrap();
        assert_eq!(driver.stored(ResourceKind::Feat, &"5".into()), Some(record.clone()));

        let response = dev
            .ioctl(IoctlOp::Query, IoctlRequest::new(ResourceKind::Feat, Filter::all()))
            .await
            .unwrap();
        assert_eq!(response, IoctlResponse::Records(vec![record]));

        match dev.read().unwrap() {
            Payload::Status(status) => {
                assert_eq!(status.driver, "memory");
                assert_eq!(status.state, "ready");
            }
            other => panic!("unexpected {other:?}"),
        }

        let placeholder = Record::placeholder(ResourceKind::Feat, "6".into());
        let err = dev.write(Payload::Record(placeholder)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
    }

    #[tokio::test]
    async fn test_ioctl_on_file_rejected() {
        let kernel = Kernel::default();
        kernel.create(&p("/x"), Payload::Document(json!(0))).unwrap();
        let guard = kernel.open_scoped(&p("/x"), OpenMode::Read).unwrap();
        let err = guard
            .ioctl(IoctlOp::Query, IoctlRequest::new(ResourceKind::Feat, Filter::all()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[tokio::test]
    async fn test_unavailable_driver_errors_capability() {
        let driver = Arc::new(MemoryDriver::new());
        let kernel = mounted(Arc::clone(&driver)).await;
        driver.set_available(false);

        let dev = kernel.open_scoped(&p("/dev/db"), OpenMode::Read).unwrap();
        let err = dev
            .ioctl(IoctlOp::Query, IoctlRequest::new(ResourceKind::Feat, Filter::all()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(kernel.capability_state(&p("/dev/db")), Some(CapabilityState::Error));

        // Refused without touching the driver until healed.
        let before = driver.calls().query;
        assert!(dev
            .ioctl(IoctlOp::Query, IoctlRequest::new(ResourceKind::Feat, Filter::all()))
            .await
            .is_err());
        assert_eq!(driver.calls().query, before);

        driver.set_available(true);
        kernel.heal(&p("/dev/db")).await.unwrap();
        dev.ioctl(IoctlOp::Query, IoctlRequest::new(ResourceKind::Feat, Filter::all()))
            .await
            .unwrap();
        assert_eq!(kernel.capability_state(&p("/dev/db")), Some(CapabilityState::Ready));
    }

    #[tokio::test]
    async fn test_unmount() {
        let kernel = mounted(Arc::new(MemoryDriver::new())).await;
        let id = kernel.unmount(&p("/dev/db")).unwrap();
        assert!(!kernel.exists(&p("/dev/db")));
        assert_eq!(kernel.capability(id).unwrap().state, CapabilityState::Uninitialized);
        // Mountable again.
        kernel.mount(&p("/dev/db"), id).await.unwrap();
    }
}
