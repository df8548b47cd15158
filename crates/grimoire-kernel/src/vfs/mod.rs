//! Virtual filesystem primitives.
//!
//! - [`NodeTree`] - path → node namespace with self-repairing `mkdir`
//! - [`FdTable`] - descriptor issue/release bookkeeping
//! - [`Payload`] - typed file content, validated against its path
//! - [`VirtualPath`] - normalized paths and the kernel's path scheme
//!
//! ## Design Decisions
//!
//! - **Typed content**: files hold a [`Payload`] enum, not bytes. The
//!   variant must agree with what the path means.
//! - **Devices hold nothing**: a device node only names a capability. Data
//!   fetched through it is cached in sibling file nodes.
//! - **Synchronous core**: tree and table never await; suspension only
//!   happens in capability calls above this layer.

mod error;
mod fd;
mod path;
mod payload;
mod tree;
mod types;

pub use error::{ErrorKind, KernelError, KernelResult};
pub use fd::{Fd, FdTable, FdTarget, FileDescriptor};
pub use path::{ENTITY_SELF, LIST_NAME, LOCK_SUFFIX, PathClass, VirtualPath};
pub use payload::{DeviceStatus, Listing, LockInfo, Payload, Record, ResourceId, ResourceKind, SchemaDoc};
pub use tree::NodeTree;
pub use types::{DirEntry, MkdirOutcome, Node, NodeKind, NodeMeta, OpenMode, Stat};

