//! # grimoire-kernel
//!
//! A virtual resource-access kernel for character and rules data.
//!
//! Every read, write and query goes through path-addressed handles:
//! - Backend drivers are mounted as devices (`/dev/db`)
//! - Resources are cached as typed file nodes (`/proc/character/42`)
//! - Directories are created and repaired on demand
//! - Advisory lock sentinels (`<path>.lock`) mark in-flight work
//! - A tiered recovery controller (cache → native → ioctl → degraded)
//!   resolves anything missing and writes it back
//!
//! Start with [`Kernel`] and [`ResourceFacade`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use grimoire_kernel::{Kernel, KernelConfig, MemoryDriver, ResourceFacade, ResourceKind};
//!
//! # async fn demo() -> Result<(), grimoire_kernel::KernelError> {
//! let kernel = Kernel::new(KernelConfig::default());
//! let cap = kernel.register_capability(Arc::new(MemoryDriver::new()));
//! kernel.mount(&kernel.default_device()?, cap).await?;
//!
//! let facade = ResourceFacade::new(Arc::new(kernel));
//! let feats = facade.list_resources(ResourceKind::Feat).await?;
//! println!("{} feats via {}", feats.value.records.len(), feats.tier);
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod events;
pub mod facade;
pub mod kernel;
pub mod lock;
pub mod recovery;
pub mod retry;
pub mod seed;
pub mod vfs;

pub use capability::{
    Capability, CapabilityId, CapabilityState, CmpOp, Condition, Driver, DriverError, DriverResult,
    Filter, IoctlOp, IoctlRequest, IoctlResponse, MemoryDriver, SqliteDriver,
};
pub use config::{ConfigError, KernelConfig};
pub use events::{Event, EventBus, EventLog, HandlerId, KernelEvent, Subscription, matches_pattern};
pub use facade::ResourceFacade;
pub use kernel::{FdGuard, Kernel, critical_dirs};
pub use lock::{LockGuard, LockManager, LockOutcome};
pub use recovery::{RecoveryController, Resolution, Tier};
pub use retry::{Backoff, RetryPolicy};
pub use seed::{SeedDocument, SeedReport};
pub use vfs::{
    DeviceStatus, DirEntry, ErrorKind, Fd, FdTable, KernelError, KernelResult, Listing, LockInfo,
    Node, NodeKind, NodeTree, OpenMode, Payload, Record, ResourceId, ResourceKind, SchemaDoc, Stat,
    VirtualPath,
};
