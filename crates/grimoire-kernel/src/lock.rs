//! Advisory lock sentinels.
//!
//! A lock is a File node at `<path>.lock` holding a [`LockInfo`]. It signals
//! "someone is working on this path" and nothing more: a contended or failed
//! acquire is logged and reported on the bus, and the caller proceeds.
//!
//! Each acquire gets a fresh owner token. The [`LockGuard`] removes the
//! sentinel on drop only if it still holds that token, so an operation can
//! never delete a lock another operation created.

use std::sync::Arc;
use uuid::Uuid;

use crate::events::{EventBus, KernelEvent};
use crate::vfs::{KernelError, LockInfo, NodeTree, Payload, VirtualPath};

/// How an acquire went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// This guard created the sentinel and will remove it.
    Held,
    /// Another owner's sentinel was already there.
    Contended { holder: String },
    /// The sentinel could not be created at all.
    Failed { reason: String },
}

/// Creates and releases lock sentinels in one tree.
#[derive(Debug, Clone)]
pub struct LockManager {
    tree: Arc<NodeTree>,
    bus: EventBus,
    owner: String,
}

impl LockManager {
    /// `owner` prefixes every token this manager hands out.
    pub fn new(tree: Arc<NodeTree>, bus: EventBus, owner: impl Into<String>) -> Self {
        Self {
            tree,
            bus,
            owner: owner.into(),
        }
    }

    /// Try to place a sentinel next to `path`. Never fails.
    pub fn acquire(&self, path: &VirtualPath, operation: &str) -> LockGuard<'_> {
        let lock_path = path.lock_path();
        let owner = format!("{}:{}", self.owner, Uuid::new_v4().simple());
        let info = LockInfo::new(owner.clone(), operation);
        let payload = Payload::Lock(info);

        let outcome = match self.try_create(&lock_path, &payload) {
            Ok(true) => {
                tracing::debug!(path = %lock_path, owner = %owner, operation, "lock acquired");
                self.bus.emit(KernelEvent::LockAcquired {
                    path: lock_path.to_string(),
                    owner: owner.clone(),
                    operation: operation.to_string(),
                });
                LockOutcome::Held
            }
            Ok(false) => {
                let holder = match self.tree.read(&lock_path) {
                    Ok(Payload::Lock(existing)) => existing.owner,
                    _ => "unknown".to_string(),
                };
                tracing::debug!(path = %lock_path, holder = %holder, operation, "lock contended, proceeding");
                self.bus.emit(KernelEvent::LockContended {
                    path: lock_path.to_string(),
                    holder: holder.clone(),
                    operation: operation.to_string(),
                });
                LockOutcome::Contended { holder }
            }
            Err(e) => {
                tracing::warn!(path = %lock_path, error = %e, "could not create lock, proceeding without");
                self.bus.emit(KernelEvent::LockFailed {
                    path: lock_path.to_string(),
                    reason: e.to_string(),
                });
                LockOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        LockGuard {
            manager: self,
            path: lock_path,
            owner,
            payload: matches!(outcome, LockOutcome::Held).then_some(payload),
            outcome,
        }
    }

    /// Whether any sentinel sits next to `path`.
    pub fn is_locked(&self, path: &VirtualPath) -> bool {
        self.tree.exists(&path.lock_path())
    }

    fn try_create(&self, lock_path: &VirtualPath, payload: &Payload) -> Result<bool, KernelError> {
        if let Some(parent) = lock_path.parent() {
            if !self.tree.exists(&parent) {
                self.tree.mkdir(&parent, true)?;
            }
        }
        self.tree.create_new(lock_path, payload.clone())
    }
}

/// Releases its sentinel when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    path: VirtualPath,
    owner: String,
    /// Present only when this guard owns the sentinel.
    payload: Option<Payload>,
    outcome: LockOutcome,
}

impl LockGuard<'_> {
    pub fn held(&self) -> bool {
        self.payload.is_some()
    }

    pub fn outcome(&self) -> &LockOutcome {
        &self.outcome
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> &VirtualPath {
        &self.path
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let Some(payload) = self.payload.take() else {
            return;
        };
        if self.manager.tree.unlink_if(&self.path, &payload) {
            self.manager.bus.emit(KernelEvent::LockReleased {
                path: self.path.to_string(),
                owner: self.owner.clone(),
            });
        } else {
            tracing::warn!(path = %self.path, owner = %self.owner, "lock vanished or changed hands before release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::capability::CapabilityId;

    fn p(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    fn manager() -> (LockManager, EventLog) {
        let bus = EventBus::new(32);
        let log = EventLog::attach(&bus, "lock.*");
        (LockManager::new(Arc::new(NodeTree::new()), bus, "test"), log)
    }

    #[test]
    fn test_acquire_and_release() {
        let (locks, log) = manager();
        let target = p("/proc/character/42");
        {
            let guard = locks.acquire(&target, "fetch");
            assert!(guard.held());
            assert!(locks.is_locked(&target));
        }
        assert!(!locks.is_locked(&target));
        assert_eq!(log.subjects(), vec!["lock.acquired", "lock.released"]);
    }

    #[test]
    fn test_contended_proceeds_without_stealing() {
        let (locks, log) = manager();
        let target = p("/proc/character/42");
        let first = locks.acquire(&target, "fetch");
        {
            let second = locks.acquire(&target, "fetch");
            assert!(!second.held());
            assert_eq!(
                second.outcome(),
                &LockOutcome::Contended {
                    holder: first.owner().to_string()
                }
            );
        }
        // Dropping the contender leaves the first lock alone.
        assert!(locks.is_locked(&target));
        drop(first);
        assert!(!locks.is_locked(&target));
        assert_eq!(log.count("lock.contended"), 1);
        assert_eq!(log.count("lock.released"), 1);
    }

    #[test]
    fn test_failed_acquire_is_not_fatal() {
        let (locks, log) = manager();
        // A device where the lock's parent directory should be.
        locks.tree.bind_device(&p("/dev/db"), CapabilityId::new()).unwrap();
        let guard = locks.acquire(&p("/dev/db/thing"), "fetch");
        assert!(matches!(guard.outcome(), LockOutcome::Failed { .. }));
        assert!(!guard.held());
        drop(guard);
        assert_eq!(log.count("lock.failed"), 1);
        assert_eq!(log.count("lock.released"), 0);
    }

    #[test]
    fn test_released_on_panic_unwind() {
        let (locks, _log) = manager();
        let target = p("/proc/feat/9");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = locks.acquire(&target, "update");
            panic!("operation blew up");
        }));
        assert!(result.is_err());
        assert!(!locks.is_locked(&target));
    }
}
