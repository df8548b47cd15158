//! File descriptor table.
//!
//! Descriptors are small non-negative integers handed out in increasing
//! order and never reused within a table, so a stale descriptor can never
//! alias a newer open.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::SystemTime;

use super::error::{KernelError, KernelResult};
use super::path::VirtualPath;
use super::types::OpenMode;
use crate::capability::CapabilityId;

/// Opaque descriptor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(i32);

impl Fd {
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// What an open descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdTarget {
    File,
    Device(CapabilityId),
}

/// An open descriptor.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub id: Fd,
    pub path: VirtualPath,
    pub mode: OpenMode,
    pub opened_at: SystemTime,
    pub target: FdTarget,
}

/// Tracks open descriptors for one kernel.
#[derive(Debug)]
pub struct FdTable {
    open: Mutex<HashMap<Fd, FileDescriptor>>,
    next: AtomicI32,
    stale_closes: AtomicU64,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            next: AtomicI32::new(3),
            stale_closes: AtomicU64::new(0),
        }
    }

    /// Register a new descriptor.
    pub fn open(&self, path: VirtualPath, mode: OpenMode, target: FdTarget) -> Fd {
        let id = Fd(self.next.fetch_add(1, Ordering::Relaxed));
        let descriptor = FileDescriptor {
            id,
            path,
            mode,
            opened_at: SystemTime::now(),
            target,
        };
        self.open.lock().insert(id, descriptor);
        id
    }

    /// Look up an open descriptor.
    pub fn get(&self, fd: Fd) -> KernelResult<FileDescriptor> {
        self.open
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(KernelError::BadDescriptor(fd.raw()))
    }

    /// Release a descriptor. Returns false, and records a stale close, if it
    /// was not open.
    pub fn close(&self, fd: Fd) -> bool {
        let removed = self.open.lock().remove(&fd).is_some();
        if !removed {
            self.stale_closes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(fd = fd.raw(), "close on a descriptor that is not open");
        }
        removed
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many closes targeted descriptors that were not open.
    pub fn stale_closes(&self) -> u64 {
        self.stale_closes.load(Ordering::Relaxed)
    }

    /// Descriptors currently open on `path`.
    pub fn open_on(&self, path: &VirtualPath) -> Vec<Fd> {
        let mut fds: Vec<Fd> = self
            .open
            .lock()
            .values()
            .filter(|d| &d.path == path)
            .map(|d| d.id)
            .collect();
        fds.sort();
        fds
    }
}
