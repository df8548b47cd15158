//! Event bus for kernel diagnostics.
//!
//! Handlers registered with [`EventBus::on`] run synchronously inside
//! [`EventBus::emit`], in registration order, before `emit` returns.
//! [`EventBus::subscribe`] additionally hands out broadcast receivers for
//! consumers that would rather poll from another task.
//!
//! Nothing in the kernel depends on an event being observed. There is no
//! queueing for handlers, no replay and no delivery guarantee.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `lock.*` matches `lock.acquired` but not `lock.a.b`
//! - `>` matches one or more tokens (only at end): `recovery.>` matches `recovery.tier`
//! - Exact match: `capability.ready` only matches `capability.ready`

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::broadcast;

use crate::capability::{CapabilityId, CapabilityState};
use crate::recovery::Tier;
use crate::vfs::ResourceKind;

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// Patterns use NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens (only at end)
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                // `>` must be at the end and matches one or more remaining tokens
                return pi == pattern_tokens.len() - 1;
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Event Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    /// Get the subject string for this payload.
    fn subject(&self) -> &str;
}

/// A message delivered to handlers and subscribers.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from payload), i.e. the event type.
    pub subject: String,
    /// The payload data.
    pub payload: T,
    /// When this message was created.
    pub timestamp: SystemTime,
}

impl<T: HasSubject> FlowMessage<T> {
    /// Create a new flow message.
    pub fn new(payload: T) -> Self {
        Self {
            subject: payload.subject().to_string(),
            payload,
            timestamp: SystemTime::now(),
        }
    }
}

/// Kernel event as seen by handlers.
pub type Event = FlowMessage<KernelEvent>;

/// Lifecycle and diagnostic events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KernelEvent {
    /// A capability moved between lifecycle states.
    CapabilityState {
        capability: CapabilityId,
        device: String,
        from: CapabilityState,
        to: CapabilityState,
    },
    /// An explicit remount swapped the capability behind a device path.
    CapabilityReplaced {
        device: String,
        previous: CapabilityId,
        current: CapabilityId,
    },
    /// A recovery tier is about to be tried.
    TierAttempt { path: String, tier: Tier },
    /// A recovery tier failed or had nothing.
    TierFailed {
        path: String,
        tier: Tier,
        reason: String,
    },
    /// A fetch finished at `tier`.
    Resolved { path: String, tier: Tier },
    /// A fetch fell through to fabricated data.
    Degraded { path: String },
    /// A fetch failed on every tier.
    Exhausted { path: String },
    /// Time spent resolving a path.
    LoadTiming {
        path: String,
        tier: Tier,
        elapsed_ms: u64,
    },
    /// Result written back to its cache node.
    CacheWritten { path: String },
    /// A cache node failed validation and was discarded.
    CacheInvalid { path: String, reason: String },
    /// A cache node was dropped after an update.
    CacheInvalidated { path: String },
    LockAcquired {
        path: String,
        owner: String,
        operation: String,
    },
    /// The lock already existed; the operation proceeds anyway.
    LockContended {
        path: String,
        holder: String,
        operation: String,
    },
    /// The sentinel could not be created; the operation proceeds anyway.
    LockFailed { path: String, reason: String },
    LockReleased { path: String, owner: String },
    /// A node was destroyed to make room for another kind.
    NodeReplaced { path: String },
    /// `close` on a descriptor that was not open.
    DoubleClose { fd: i32 },
    /// A retried operation failed one attempt.
    RetryAttempt {
        operation: String,
        attempt: u32,
        reason: String,
    },
    ResourceUpdated { kind: ResourceKind, id: String },
    SeedImported {
        kind: ResourceKind,
        count: usize,
        dry_run: bool,
    },
}

impl KernelEvent {
    /// Get the subject string for this event.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::CapabilityState { to, .. } => match to {
                CapabilityState::Uninitialized => "capability.uninitialized",
                CapabilityState::Mounting => "capability.mounting",
                CapabilityState::Ready => "capability.ready",
                CapabilityState::Error => "capability.error",
                CapabilityState::Recovered => "capability.recovered",
            },
            Self::CapabilityReplaced { .. } => "capability.replaced",
            Self::TierAttempt { .. } => "recovery.tier",
            Self::TierFailed { .. } => "recovery.tier_failed",
            Self::Resolved { .. } => "recovery.resolved",
            Self::Degraded { .. } => "recovery.degraded",
            Self::Exhausted { .. } => "recovery.exhausted",
            Self::LoadTiming { .. } => "load.timing",
            Self::CacheWritten { .. } => "cache.written",
            Self::CacheInvalid { .. } => "cache.invalid",
            Self::CacheInvalidated { .. } => "cache.invalidated",
            Self::LockAcquired { .. } => "lock.acquired",
            Self::LockContended { .. } => "lock.contended",
            Self::LockFailed { .. } => "lock.failed",
            Self::LockReleased { .. } => "lock.released",
            Self::NodeReplaced { .. } => "node.replaced",
            Self::DoubleClose { .. } => "fd.double_close",
            Self::RetryAttempt { .. } => "retry.attempt",
            Self::ResourceUpdated { .. } => "resource.updated",
            Self::SeedImported { .. } => "seed.imported",
        }
    }
}

impl HasSubject for KernelEvent {
    fn subject(&self) -> &str {
        KernelEvent::subject(self)
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Identifies a registered handler, for [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct HandlerSlot {
    id: HandlerId,
    pattern: String,
    handler: Handler,
}

struct BusInner {
    handlers: RwLock<Vec<HandlerSlot>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<Event>,
    capacity: usize,
}

/// Synchronous publish/subscribe channel owned by one kernel.
///
/// Cloning is cheap and every clone shares handlers and subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose broadcast subscribers buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                tx,
                capacity,
            }),
        }
    }

    /// Register a handler for subjects matching `pattern`.
    pub fn on<F>(&self, pattern: &str, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.write().push(HandlerSlot {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|slot| slot.id != id);
        handlers.len() != before
    }

    /// Deliver an event to every matching handler, then to broadcast
    /// subscribers. Returns the number of handlers invoked.
    pub fn emit(&self, payload: KernelEvent) -> usize {
        let msg = FlowMessage::new(payload);

        // Snapshot so handlers may emit or register without deadlocking.
        let matching: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|slot| matches_pattern(&slot.pattern, &msg.subject))
            .map(|slot| Arc::clone(&slot.handler))
            .collect();

        tracing::trace!(subject = %msg.subject, handlers = matching.len(), "emit");
        for handler in &matching {
            handler(&msg);
        }

        let _ = self.inner.tx.send(msg);
        matching.len()
    }

    /// Subscribe to events matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Get the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Get the number of active broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A broadcast subscription with pattern filtering.
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Get the subscription pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching event, waiting if necessary.
    ///
    /// Returns None if the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Event subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Try to receive the next matching event without blocking.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Event subscription lagged behind"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Collects every event matching a pattern. Handy in tests and for
/// callers that want a post-hoc trace of one operation.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<parking_lot::Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Attach a new log to `bus`.
    pub fn attach(bus: &EventBus, pattern: &str) -> Self {
        let log = Self::default();
        let sink = Arc::clone(&log.events);
        bus.on(pattern, move |event| sink.lock().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.subject.clone()).collect()
    }

    pub fn count(&self, subject: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.subject == subject)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn released(path: &str) -> KernelEvent {
        KernelEvent::LockReleased {
            path: path.into(),
            owner: "t".into(),
        }
    }

    #[test]
    fn test_pattern_matching_exact() {
        assert!(matches_pattern("lock.acquired", "lock.acquired"));
        assert!(!matches_pattern("lock.acquired", "lock.released"));
        assert!(!matches_pattern("lock.acquired", "lock.acquired.extra"));
    }

    #[test]
    fn test_pattern_matching_single_wildcard() {
        assert!(matches_pattern("lock.*", "lock.acquired"));
        assert!(matches_pattern("lock.*", "lock.released"));
        assert!(!matches_pattern("lock.*", "lock.a.b"));
        assert!(!matches_pattern("lock.*", "cache.written"));
    }

    #[test]
    fn test_pattern_matching_multi_wildcard() {
        assert!(matches_pattern("recovery.>", "recovery.tier"));
        assert!(matches_pattern("recovery.>", "recovery.a.b.c"));
        assert!(matches_pattern(">", "anything.at.all"));
        assert!(!matches_pattern("recovery.>", "recovery"));
        assert!(!matches_pattern("recovery.>", "cache.written"));
    }

    #[test]
    fn test_pattern_matching_mixed() {
        assert!(matches_pattern("*.ready", "capability.ready"));
        assert!(!matches_pattern("*.ready", "capability.error"));
    }

    #[test]
    fn test_handlers_run_before_emit_returns() {
        let bus = EventBus::new(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.on("lock.*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(released("/a.lock")), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert_eq!(bus.emit(KernelEvent::DoubleClose { fd: 4 }), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_in_registration_order() {
        let bus = EventBus::new(16);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.on(">", move |_| order.lock().push(n));
        }
        bus.emit(released("/x.lock"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_off() {
        let bus = EventBus::new(16);
        let id = bus.on(">", |_| {});
        assert_eq!(bus.handler_count(), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.emit(released("/x.lock")), 0);
    }

    #[test]
    fn test_handler_may_emit() {
        let bus = EventBus::new(16);
        let log = EventLog::attach(&bus, ">");
        let inner = bus.clone();
        bus.on("lock.released", move |_| {
            inner.emit(KernelEvent::DoubleClose { fd: 9 });
        });

        bus.emit(released("/x.lock"));
        assert_eq!(log.subjects(), vec!["lock.released", "fd.double_close"]);
    }

    #[test]
    fn test_subscription_pattern_filtering() {
        let bus = EventBus::new(16);
        let mut lock_sub = bus.subscribe("lock.*");
        let mut fd_sub = bus.subscribe("fd.*");

        bus.emit(released("/a.lock"));
        bus.emit(KernelEvent::DoubleClose { fd: 3 });

        let msg = lock_sub.try_recv().expect("should have message");
        assert_eq!(msg.subject, "lock.released");
        assert!(lock_sub.try_recv().is_none());

        let msg = fd_sub.try_recv().expect("should have message");
        assert_eq!(msg.payload, KernelEvent::DoubleClose { fd: 3 });
        assert!(fd_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscription_recv() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe("seed.*");

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.emit(KernelEvent::SeedImported {
                kind: ResourceKind::Feat,
                count: 3,
                dry_run: false,
            });
        });

        let msg = tokio::time::timeout(std::time::Duration::from_millis(500), sub.recv())
            .await
            .expect("timeout")
            .expect("no message");
        assert_eq!(msg.subject, "seed.imported");
    }
}
