//! Virtual paths and the kernel's path scheme.
//!
//! ```text
//! /dev/<capability>          mounted backend device
//! /proc/<kind>/<id>          cached single resource
//! /proc/<kind>/list          cached listing
//! /entity/<id>/self          cached entity
//! /entity/<id>/<sub>         entity sub-resource listing
//! /etc/schema/<kind>         schema document
//! <path>.lock                advisory lock sentinel
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{KernelError, KernelResult};
use super::payload::{ResourceId, ResourceKind};

/// Suffix appended to a path to form its lock sentinel.
pub const LOCK_SUFFIX: &str = ".lock";

/// Reserved final component for listing nodes.
pub const LIST_NAME: &str = "list";

/// Name of an entity's own record inside its directory. Not a resource
/// kind, so it never collides with a sub-resource listing.
pub const ENTITY_SELF: &str = "self";

/// A normalized, absolute, `/`-delimited path.
///
/// Normalization drops empty and `.` components and resolves `..` without
/// escaping the root. The root is `/`; no other path ends with `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The root directory.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Wrap a literal that is already normalized.
    pub(crate) fn from_static(path: &'static str) -> Self {
        debug_assert!(path.starts_with('/') && !path.ends_with('/') && !path.contains("//"));
        Self(path.to_string())
    }

    /// Parse and normalize a path.
    pub fn parse(raw: &str) -> KernelResult<Self> {
        if raw.is_empty() {
            return Err(KernelError::invalid_path("<empty>"));
        }
        if raw.contains('\0') {
            return Err(KernelError::invalid_path(raw.replace('\0', "\\0")));
        }

        let mut parts: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }

        if parts.is_empty() {
            Ok(Self::root())
        } else {
            Ok(Self(format!("/{}", parts.join("/"))))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent directory, `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final component, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// Append a single component. Slashes inside `name` are rejected.
    pub fn join(&self, name: &str) -> KernelResult<VirtualPath> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(KernelError::invalid_path(format!("{}/{}", self.0, name)));
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }

    /// Path components, root excluded.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// All proper ancestors from the root downward, root included.
    pub fn ancestors(&self) -> Vec<VirtualPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out.reverse();
        out
    }

    /// Lock sentinel path: `<path>.lock`.
    pub fn lock_path(&self) -> VirtualPath {
        if self.is_root() {
            Self(format!("/{LOCK_SUFFIX}"))
        } else {
            Self(format!("{}{LOCK_SUFFIX}", self.0))
        }
    }

    pub fn is_lock(&self) -> bool {
        self.0.ends_with(LOCK_SUFFIX)
    }

    /// Classify this path according to the kernel's path scheme.
    pub fn classify(&self) -> PathClass {
        if self.is_lock() {
            return PathClass::Lock;
        }

        let parts: Vec<&str> = self.components().collect();
        match parts.as_slice() {
            ["dev", name] => PathClass::Device((*name).to_string()),
            ["proc", kind, LIST_NAME] => match kind.parse::<ResourceKind>() {
                Ok(kind) => PathClass::Listing(kind),
                Err(_) => PathClass::Plain,
            },
            ["proc", kind, id] => match kind.parse::<ResourceKind>() {
                Ok(kind) => PathClass::Record(kind, ResourceId::new(*id)),
                Err(_) => PathClass::Plain,
            },
            ["entity", id, ENTITY_SELF] => {
                PathClass::Record(ResourceKind::Entity, ResourceId::new(*id))
            }
            ["entity", id, sub] => match sub.parse::<ResourceKind>() {
                Ok(kind) => PathClass::EntitySub(ResourceId::new(*id), kind),
                Err(_) => PathClass::Plain,
            },
            ["etc", "schema", kind] => match kind.parse::<ResourceKind>() {
                Ok(kind) => PathClass::Schema(kind),
                Err(_) => PathClass::Plain,
            },
            _ => PathClass::Plain,
        }
    }

    /// Cache location for a single resource.
    pub fn for_record(kind: ResourceKind, id: &ResourceId) -> KernelResult<VirtualPath> {
        match kind {
            ResourceKind::Entity => Self::entity_dir(id)?.join(ENTITY_SELF),
            kind => Self(format!("/proc/{kind}")).join(checked_id(id)?),
        }
    }

    /// Cache location for a listing of `kind`.
    pub fn for_listing(kind: ResourceKind) -> VirtualPath {
        Self(format!("/proc/{kind}/{LIST_NAME}"))
    }

    /// Cache location for an entity's sub-resource listing.
    pub fn for_entity_sub(id: &ResourceId, sub: ResourceKind) -> KernelResult<VirtualPath> {
        Self::entity_dir(id)?.join(sub.as_ref())
    }

    fn entity_dir(id: &ResourceId) -> KernelResult<VirtualPath> {
        Self::from_static("/entity").join(checked_id(id)?)
    }

    /// Schema document location for `kind`.
    pub fn for_schema(kind: ResourceKind) -> VirtualPath {
        Self(format!("/etc/schema/{kind}"))
    }

    /// Device path for a capability name.
    pub fn for_device(name: &str) -> KernelResult<VirtualPath> {
        Self::parse("/dev")?.join(name)
    }
}

/// Ids become a single path component and must not collide with reserved
/// names or normalize away.
fn checked_id(id: &ResourceId) -> KernelResult<&str> {
    let id = id.as_str();
    let reserved = matches!(id, "." | ".." | LIST_NAME) || id.ends_with(LOCK_SUFFIX);
    if id.is_empty() || id.contains('/') || id.contains('\0') || reserved {
        return Err(KernelError::invalid_path(format!("resource id {id:?}")));
    }
    Ok(id)
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for VirtualPath {
    type Error = KernelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<VirtualPath> for String {
    fn from(path: VirtualPath) -> Self {
        path.0
    }
}

/// Role of a path within the path scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathClass {
    /// `/dev/<name>`
    Device(String),
    /// `/proc/<kind>/<id>` or `/entity/<id>/self`
    Record(ResourceKind, ResourceId),
    /// `/proc/<kind>/list`
    Listing(ResourceKind),
    /// `/entity/<id>/<sub>`
    EntitySub(ResourceId, ResourceKind),
    /// `/etc/schema/<kind>`
    Schema(ResourceKind),
    /// `<path>.lock`
    Lock,
    /// Anything else.
    Plain,
}
