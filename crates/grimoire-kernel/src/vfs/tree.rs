//! In-memory node tree.
//!
//! All mutation happens under one `parking_lot::RwLock` and never across an
//! `.await`, so every method here is synchronous.
//!
//! ## Overwrite policy
//!
//! The tree repairs kind conflicts instead of failing, and logs every repair:
//!
//! - `mkdir` over a File node removes the file and creates a directory.
//! - `create` over an *empty* directory replaces it with a file.
//!
//! Both are lossy on purpose. Device nodes and non-empty directories are
//! never destroyed by a repair; those conflicts are `TypeMismatch` errors.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::error::{KernelError, KernelResult};
use super::path::VirtualPath;
use super::payload::Payload;
use super::types::{DirEntry, MkdirOutcome, Node, NodeKind, Stat};
use crate::capability::CapabilityId;

type Entries = BTreeMap<VirtualPath, Node>;

/// Hierarchical namespace of directories, files and devices.
#[derive(Debug)]
pub struct NodeTree {
    entries: RwLock<Entries>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// Create a tree holding only the root directory.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(VirtualPath::root(), Node::directory());
        Self {
            entries: RwLock::new(entries),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn exists(&self, path: &VirtualPath) -> bool {
        self.entries.read().contains_key(path)
    }

    pub fn kind_of(&self, path: &VirtualPath) -> Option<NodeKind> {
        self.entries.read().get(path).map(Node::kind)
    }

    pub fn stat(&self, path: &VirtualPath) -> Option<Stat> {
        let entries = self.entries.read();
        let node = entries.get(path)?;
        let meta = node.meta();
        let (entries_count, has_content) = match node {
            Node::Directory { children, .. } => (children.len(), false),
            Node::File { payload, .. } => (0, payload.is_some()),
            Node::Device { .. } => (0, false),
        };
        Some(Stat {
            kind: node.kind(),
            entries: entries_count,
            has_content,
            modified_at: meta.modified_at,
            version: meta.version,
        })
    }

    /// List a directory, sorted by name.
    pub fn readdir(&self, path: &VirtualPath) -> KernelResult<Vec<DirEntry>> {
        let entries = self.entries.read();
        match entries.get(path) {
            Some(Node::Directory { children, .. }) => Ok(children
                .iter()
                .filter_map(|name| {
                    let child = path.join(name).ok()?;
                    entries.get(&child).map(|n| DirEntry::new(name.clone(), n.kind()))
                })
                .collect()),
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "directory",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Capability bound at a device path.
    pub fn device_at(&self, path: &VirtualPath) -> Option<CapabilityId> {
        match self.entries.read().get(path) {
            Some(Node::Device { capability, .. }) => Some(*capability),
            _ => None,
        }
    }

    /// Read a file's payload.
    pub fn read(&self, path: &VirtualPath) -> KernelResult<Payload> {
        match self.entries.read().get(path) {
            Some(Node::File {
                payload: Some(payload),
                ..
            }) => Ok(payload.clone()),
            Some(Node::File { payload: None, .. }) => {
                Err(KernelError::integrity(path.as_str(), "file is empty"))
            }
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "file",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Structural snapshot: every path with its kind and child names.
    pub fn dump(&self) -> Vec<(VirtualPath, NodeKind, Vec<String>)> {
        self.entries
            .read()
            .iter()
            .map(|(path, node)| {
                let children = match node {
                    Node::Directory { children, .. } => children.iter().cloned().collect(),
                    _ => Vec::new(),
                };
                (path.clone(), node.kind(), children)
            })
            .collect()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Create a directory.
    ///
    /// With `recursive`, every missing ancestor is created and calling it
    /// again is a no-op. Without it, the parent must already be a directory.
    /// File nodes in the way are replaced (see module docs).
    pub fn mkdir(&self, path: &VirtualPath, recursive: bool) -> KernelResult<MkdirOutcome> {
        let mut entries = self.entries.write();
        let outcome = mkdir_locked(&mut entries, path, recursive)?;
        drop(entries);

        for replaced in &outcome.replaced {
            tracing::warn!(path = %replaced, "mkdir replaced a file node with a directory");
        }
        Ok(outcome)
    }

    /// Create or overwrite a file with `payload`.
    ///
    /// Missing ancestors are created as in a recursive `mkdir`.
    pub fn create(&self, path: &VirtualPath, payload: Payload) -> KernelResult<MkdirOutcome> {
        payload.validate_for(path)?;
        let parent = parent_of(path)?;

        let mut entries = self.entries.write();
        let outcome = mkdir_locked(&mut entries, &parent, true)?;

        match entries.get_mut(path) {
            Some(Node::File {
                payload: existing,
                meta,
            }) => {
                *existing = Some(payload);
                meta.touch();
            }
            Some(Node::Directory { children, .. }) if children.is_empty() => {
                tracing::warn!(path = %path, "create replaced an empty directory with a file");
                entries.insert(path.clone(), Node::file(Some(payload)));
            }
            Some(other) => {
                return Err(KernelError::type_mismatch(
                    path.as_str(),
                    "file",
                    other.kind().name(),
                ));
            }
            None => {
                entries.insert(path.clone(), Node::file(Some(payload)));
                link_child(&mut entries, path);
            }
        }
        drop(entries);

        for replaced in &outcome.replaced {
            tracing::warn!(path = %replaced, "create replaced a file node with a directory");
        }
        Ok(outcome)
    }

    /// Create an empty file if nothing exists at `path`. The parent must be a
    /// directory. Returns true if a node was created.
    pub fn touch(&self, path: &VirtualPath) -> KernelResult<bool> {
        let parent = parent_of(path)?;
        let mut entries = self.entries.write();
        require_directory(&entries, &parent)?;
        if let Some(existing) = entries.get(path) {
            return match existing.kind() {
                NodeKind::File => Ok(false),
                other => Err(KernelError::type_mismatch(path.as_str(), "file", other.name())),
            };
        }
        entries.insert(path.clone(), Node::file(None));
        link_child(&mut entries, path);
        Ok(true)
    }

    /// Create a file only if the path is free. Never repairs conflicts and
    /// never creates ancestors. Returns false if something already exists.
    pub fn create_new(&self, path: &VirtualPath, payload: Payload) -> KernelResult<bool> {
        payload.validate_for(path)?;
        let parent = parent_of(path)?;
        let mut entries = self.entries.write();
        require_directory(&entries, &parent)?;
        if entries.contains_key(path) {
            return Ok(false);
        }
        entries.insert(path.clone(), Node::file(Some(payload)));
        link_child(&mut entries, path);
        Ok(true)
    }

    /// Overwrite the payload of an existing file.
    pub fn write(&self, path: &VirtualPath, payload: Payload) -> KernelResult<()> {
        payload.validate_for(path)?;
        let mut entries = self.entries.write();
        match entries.get_mut(path) {
            Some(Node::File {
                payload: existing,
                meta,
            }) => {
                *existing = Some(payload);
                meta.touch();
                Ok(())
            }
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "file",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Remove a file.
    pub fn unlink(&self, path: &VirtualPath) -> KernelResult<()> {
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(Node::File { .. }) => {
                entries.remove(path);
                unlink_child(&mut entries, path);
                Ok(())
            }
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "file",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Remove a file only if it still holds `expected`. Returns true if it
    /// was removed.
    pub fn unlink_if(&self, path: &VirtualPath, expected: &Payload) -> bool {
        let mut entries = self.entries.write();
        let matches = matches!(
            entries.get(path),
            Some(Node::File { payload: Some(p), .. }) if p == expected
        );
        if matches {
            entries.remove(path);
            unlink_child(&mut entries, path);
        }
        matches
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &VirtualPath) -> KernelResult<()> {
        if path.is_root() {
            return Err(KernelError::invalid_path("cannot remove root"));
        }
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(Node::Directory { children, .. }) if children.is_empty() => {
                entries.remove(path);
                unlink_child(&mut entries, path);
                Ok(())
            }
            Some(Node::Directory { .. }) => Err(KernelError::type_mismatch(
                path.as_str(),
                "empty directory",
                "directory",
            )),
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "directory",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Bind a capability at `path`, creating ancestors.
    pub fn bind_device(&self, path: &VirtualPath, capability: CapabilityId) -> KernelResult<()> {
        let parent = parent_of(path)?;
        let mut entries = self.entries.write();
        mkdir_locked(&mut entries, &parent, true)?;

        match entries.get(path) {
            None => {
                entries.insert(path.clone(), Node::device(capability));
                link_child(&mut entries, path);
                Ok(())
            }
            Some(Node::Device { .. }) => Err(KernelError::AlreadyMounted(path.to_string())),
            Some(Node::File { .. }) => {
                tracing::warn!(path = %path, "device bind replaced a file node");
                entries.insert(path.clone(), Node::device(capability));
                Ok(())
            }
            Some(Node::Directory { children, .. }) if children.is_empty() => {
                tracing::warn!(path = %path, "device bind replaced an empty directory");
                entries.insert(path.clone(), Node::device(capability));
                Ok(())
            }
            Some(Node::Directory { .. }) => Err(KernelError::type_mismatch(
                path.as_str(),
                "device",
                "directory",
            )),
        }
    }

    /// Point an existing device node at another capability. Returns the
    /// previous one.
    pub fn rebind_device(
        &self,
        path: &VirtualPath,
        capability: CapabilityId,
    ) -> KernelResult<CapabilityId> {
        let mut entries = self.entries.write();
        match entries.get_mut(path) {
            Some(Node::Device {
                capability: bound,
                meta,
            }) => {
                let previous = std::mem::replace(bound, capability);
                meta.touch();
                Ok(previous)
            }
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "device",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }

    /// Remove a device node.
    pub fn unbind_device(&self, path: &VirtualPath) -> KernelResult<CapabilityId> {
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(Node::Device { capability, .. }) => {
                let capability = *capability;
                entries.remove(path);
                unlink_child(&mut entries, path);
                Ok(capability)
            }
            Some(other) => Err(KernelError::type_mismatch(
                path.as_str(),
                "device",
                other.kind().name(),
            )),
            None => Err(KernelError::not_found(path.as_str())),
        }
    }
}

fn parent_of(path: &VirtualPath) -> KernelResult<VirtualPath> {
    path.parent()
        .ok_or_else(|| KernelError::invalid_path("root has no parent"))
}

fn require_directory(entries: &Entries, path: &VirtualPath) -> KernelResult<()> {
    match entries.get(path) {
        Some(Node::Directory { .. }) => Ok(()),
        Some(other) => Err(KernelError::type_mismatch(
            path.as_str(),
            "directory",
            other.kind().name(),
        )),
        None => Err(KernelError::not_found(path.as_str())),
    }
}

fn link_child(entries: &mut Entries, path: &VirtualPath) {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return;
    };
    if let Some(Node::Directory { children, meta }) = entries.get_mut(&parent) {
        if children.insert(name.to_string()) {
            meta.touch();
        }
    }
}

fn unlink_child(entries: &mut Entries, path: &VirtualPath) {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return;
    };
    if let Some(Node::Directory { children, meta }) = entries.get_mut(&parent) {
        if children.remove(name) {
            meta.touch();
        }
    }
}

fn mkdir_locked(
    entries: &mut Entries,
    path: &VirtualPath,
    recursive: bool,
) -> KernelResult<MkdirOutcome> {
    let mut outcome = MkdirOutcome::default();

    let chain: Vec<VirtualPath> = if recursive {
        let mut chain = path.ancestors();
        chain.push(path.clone());
        chain
    } else {
        if let Some(parent) = path.parent() {
            require_directory(entries, &parent)?;
        }
        vec![path.clone()]
    };

    for dir in chain {
        match entries.get(&dir) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File { .. }) => {
                entries.insert(dir.clone(), Node::directory());
                outcome.replaced.push(dir);
            }
            Some(Node::Device { .. }) => {
                return Err(KernelError::type_mismatch(dir.as_str(), "directory", "device"));
            }
            None => {
                entries.insert(dir.clone(), Node::directory());
                link_child(entries, &dir);
                outcome.created.push(dir);
            }
        }
    }

    Ok(outcome)
}
