//! Core node types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;

use super::payload::Payload;
use crate::capability::CapabilityId;

/// Node kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    /// Directory.
    Directory,
    /// Regular file holding a payload.
    File,
    /// Mounted capability.
    Device,
}

impl NodeKind {
    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    /// Returns true if this is a device.
    pub fn is_device(&self) -> bool {
        matches!(self, NodeKind::Device)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            NodeKind::Directory => "directory",
            NodeKind::File => "file",
            NodeKind::Device => "device",
        }
    }
}

/// Timestamps and write counter shared by every node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMeta {
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    /// Bumped on every content write.
    pub version: u64,
}

impl NodeMeta {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            created_at: now,
            modified_at: now,
            version: 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.modified_at = SystemTime::now();
        self.version += 1;
    }
}

impl Default for NodeMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry in the node tree.
#[derive(Debug, Clone)]
pub enum Node {
    Directory {
        children: BTreeSet<String>,
        meta: NodeMeta,
    },
    /// `payload` is `None` for a file that was created but never written.
    File {
        payload: Option<Payload>,
        meta: NodeMeta,
    },
    /// Cached content for a device lives in sibling files, never here.
    Device {
        capability: CapabilityId,
        meta: NodeMeta,
    },
}

impl Node {
    pub fn directory() -> Self {
        Node::Directory {
            children: BTreeSet::new(),
            meta: NodeMeta::new(),
        }
    }

    pub fn file(payload: Option<Payload>) -> Self {
        Node::File {
            payload,
            meta: NodeMeta::new(),
        }
    }

    pub fn device(capability: CapabilityId) -> Self {
        Node::Device {
            capability,
            meta: NodeMeta::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Directory { .. } => NodeKind::Directory,
            Node::File { .. } => NodeKind::File,
            Node::Device { .. } => NodeKind::Device,
        }
    }

    pub fn meta(&self) -> &NodeMeta {
        match self {
            Node::Directory { meta, .. } | Node::File { meta, .. } | Node::Device { meta, .. } => {
                meta
            }
        }
    }
}

/// Result of `stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub kind: NodeKind,
    /// Number of children for directories, 0 otherwise.
    pub entries: usize,
    /// False for a file with no payload yet.
    pub has_content: bool,
    pub modified_at: SystemTime,
    pub version: u64,
}

impl Stat {
    pub fn is_directory(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: NodeKind,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Access mode of an open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn readable(&self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// What a directory change did, so callers can report lossy repairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MkdirOutcome {
    /// Directories that did not exist before.
    pub created: Vec<super::VirtualPath>,
    /// File nodes that were destroyed to make room for directories.
    pub replaced: Vec<super::VirtualPath>,
}

impl MkdirOutcome {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.replaced.is_empty()
    }
}
