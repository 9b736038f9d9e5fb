//! # Connection Admission Controller
//!
//! Three gates applied at connection time:
//!
//! 1. **Reconnection backoff** — per-identity exponential backoff against
//!    reconnection storms. Memory-only; losing it on restart fails open.
//! 2. **System capacity** — a process-wide cap on concurrent connections
//!    with a strict-FIFO wait queue and a 30-second queue timeout.
//! 3. **Per-identity concurrency** — at most two simultaneous connections
//!    per identity, with lazy staleness cleanup.
//!
//! ## Concurrency
//!
//! Each gate owns its map behind its own `tokio::sync::Mutex`. The only
//! suspending operation is waiting on a queued admission: the queue entry
//! holds a `oneshot` sender and is resolved exactly once — by a capacity
//! drain, by the timeout task, or by explicit cancellation. Both resolution
//! paths check-and-remove the entry under the lock, so a concurrent drain
//! and timeout can never double-resolve.
//!
//! ## Invariants
//!
//! - The active set never exceeds `max_concurrent` (admit and drain both
//!   insert only while below the cap, under the lock).
//! - Queue order is strict FIFO; no priority reordering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::escalation::{ActivityKind, EscalationTracker};
use crate::identity::Identity;

/// Maximum identities tracked for reconnection backoff.
/// Uses LRU eviction when full.
const MAX_TRACKED_RECONNECTS: usize = 10_000;

/// Process-wide unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tunables for the admission gates. Defaults match production policy.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Process-wide concurrent connection cap.
    pub max_concurrent: usize,
    /// How long a queued connection waits for a slot before giving up.
    pub queue_timeout: Duration,
    /// Observation window for reconnection counting.
    pub reconnect_window: Duration,
    /// Reconnection attempts inside the window before backoff starts.
    pub rapid_reconnect_threshold: u32,
    /// First backoff step; doubles per further attempt.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Simultaneous connections allowed per identity.
    pub max_per_identity: usize,
    /// Per-identity connection entries older than this are dropped lazily.
    pub connection_stale_after: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            queue_timeout: Duration::from_secs(30),
            reconnect_window: Duration::from_secs(60),
            rapid_reconnect_threshold: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_per_identity: 2,
            connection_stale_after: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of the reconnection-backoff gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffDecision {
    Allowed,
    Throttled {
        /// Remaining mandatory wait.
        retry_after_ms: u64,
    },
}

#[derive(Clone, Copy, Debug)]
struct ReconnectionEntry {
    /// Attempts inside the current observation window.
    count: u32,
    last_attempt_ms: u64,
    backoff_until_ms: u64,
}

/// One live connection held against an identity's concurrency budget.
#[derive(Clone, Copy, Debug)]
struct ConnectionInfo {
    connection_id: ConnectionId,
    connected_at_ms: u64,
}

/// Final resolution of a queued admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A slot was freed and this connection now occupies it.
    Admitted,
    /// No slot freed within the queue timeout. Not a hard error; the
    /// caller should retry later.
    TimedOut,
}

/// Immediate result of an admission attempt.
pub enum Admission {
    /// A slot was free; the connection is active.
    Granted,
    /// At capacity; the connection is queued.
    Queued {
        /// 1-based position in the wait queue at enqueue time.
        position: usize,
        /// Await this for the final outcome; resolved exactly once.
        ticket: AdmissionTicket,
    },
}

/// Pending resolution of a queued admission.
pub struct AdmissionTicket {
    waiter_id: u64,
    rx: oneshot::Receiver<AdmitOutcome>,
}

impl AdmissionTicket {
    /// Identifier used to cancel the wait if the underlying connection
    /// closes before resolution.
    pub fn waiter_id(&self) -> u64 {
        self.waiter_id
    }

    /// Wait for the queue entry to resolve. A cancelled entry reports
    /// `TimedOut` (the connection is gone either way).
    pub async fn wait(self) -> AdmitOutcome {
        self.rx.await.unwrap_or(AdmitOutcome::TimedOut)
    }
}

struct Waiter {
    waiter_id: u64,
    connection_id: ConnectionId,
    identity: Identity,
    enqueued_at_ms: u64,
    tx: oneshot::Sender<AdmitOutcome>,
}

#[derive(Default)]
struct CapacityState {
    active: HashSet<ConnectionId>,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// The admission controller. Shared as `Arc` so the queue-timeout task can
/// reach back into the state it guards.
pub struct AdmissionController {
    config: AdmissionConfig,
    clock: SharedClock,
    escalation: Arc<EscalationTracker>,
    reconnects: Mutex<LruCache<Identity, ReconnectionEntry>>,
    capacity: Mutex<CapacityState>,
    per_identity: Mutex<HashMap<Identity, Vec<ConnectionInfo>>>,
}

impl AdmissionController {
    pub fn new(
        config: AdmissionConfig,
        clock: SharedClock,
        escalation: Arc<EscalationTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            escalation,
            reconnects: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_RECONNECTS).expect("reconnect bound"),
            )),
            capacity: Mutex::new(CapacityState::default()),
            per_identity: Mutex::new(HashMap::new()),
        })
    }

    // ========================================================================
    // Gate 1: reconnection backoff
    // ========================================================================

    /// Check the reconnection-storm gate for one connection attempt.
    ///
    /// The first attempts inside the observation window are free; from the
    /// rapid-reconnection threshold onward each attempt is denied with an
    /// exponentially growing mandatory wait, capped at `backoff_cap`.
    pub async fn check_backoff(&self, identity: Identity) -> BackoffDecision {
        let now = self.clock.now_ms();
        let window_ms = self.config.reconnect_window.as_millis() as u64;

        let mut reconnects = self.reconnects.lock().await;
        let stale = reconnects
            .get(&identity)
            .is_none_or(|e| now.saturating_sub(e.last_attempt_ms) > window_ms);
        if stale {
            reconnects.put(
                identity,
                ReconnectionEntry {
                    count: 1,
                    last_attempt_ms: now,
                    backoff_until_ms: 0,
                },
            );
            return BackoffDecision::Allowed;
        }

        let entry = reconnects
            .get_mut(&identity)
            .expect("entry present: just checked");

        // Inside an imposed backoff: deny with the remaining wait. The
        // entry is not touched, so the window ages out from the last
        // counted attempt.
        if now < entry.backoff_until_ms {
            return BackoffDecision::Throttled {
                retry_after_ms: entry.backoff_until_ms - now,
            };
        }

        entry.count += 1;
        entry.last_attempt_ms = now;

        if entry.count >= self.config.rapid_reconnect_threshold {
            let backoff_ms = self.backoff_for(entry.count);
            entry.backoff_until_ms = now + backoff_ms;
            drop(reconnects);

            self.escalation
                .record(
                    identity,
                    ActivityKind::RapidReconnection,
                    format!("reconnection attempt within observation window, backoff {backoff_ms}ms"),
                )
                .await;
            warn!(identity = %identity, backoff_ms, "reconnection storm throttled");
            return BackoffDecision::Throttled {
                retry_after_ms: backoff_ms,
            };
        }

        BackoffDecision::Allowed
    }

    /// `min(base · 2^(count − threshold), cap)` in milliseconds.
    fn backoff_for(&self, count: u32) -> u64 {
        let base = self.config.backoff_base.as_millis() as u64;
        let cap = self.config.backoff_cap.as_millis() as u64;
        let exp = count
            .saturating_sub(self.config.rapid_reconnect_threshold)
            .min(32);
        base.saturating_mul(1u64 << exp).min(cap)
    }

    // ========================================================================
    // Gate 2: system capacity
    // ========================================================================

    /// Admit a connection into the process-wide capacity budget, or queue
    /// it when at capacity.
    ///
    /// Queued entries resolve exactly once: admitted by a capacity drain,
    /// timed out after `queue_timeout`, or cancelled via [`cancel_wait`].
    ///
    /// [`cancel_wait`]: Self::cancel_wait
    pub async fn admit(self: &Arc<Self>, connection_id: ConnectionId, identity: Identity) -> Admission {
        let mut capacity = self.capacity.lock().await;

        if capacity.active.len() < self.config.max_concurrent {
            capacity.active.insert(connection_id);
            return Admission::Granted;
        }

        let waiter_id = capacity.next_waiter_id;
        capacity.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        capacity.queue.push_back(Waiter {
            waiter_id,
            connection_id,
            identity,
            enqueued_at_ms: self.clock.now_ms(),
            tx,
        });
        let position = capacity.queue.len();
        drop(capacity);

        debug!(%connection_id, identity = %identity, position, "system at capacity, connection queued");

        let this = Arc::clone(self);
        let timeout = self.config.queue_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire_waiter(waiter_id).await;
        });

        Admission::Queued {
            position,
            ticket: AdmissionTicket { waiter_id, rx },
        }
    }

    /// Timeout path: resolve the entry as timed out if it is still queued.
    /// Check-and-remove runs under the lock, so a concurrent drain cannot
    /// double-resolve.
    async fn expire_waiter(&self, waiter_id: u64) {
        let mut capacity = self.capacity.lock().await;
        let Some(pos) = capacity
            .queue
            .iter()
            .position(|w| w.waiter_id == waiter_id)
        else {
            return;
        };
        let waiter = capacity
            .queue
            .remove(pos)
            .expect("position valid under lock");
        drop(capacity);

        let waited_ms = self.clock.now_ms().saturating_sub(waiter.enqueued_at_ms);
        warn!(connection_id = %waiter.connection_id, identity = %waiter.identity, waited_ms,
            "queued connection timed out");
        let _ = waiter.tx.send(AdmitOutcome::TimedOut);
    }

    /// Cancel a queued admission because the underlying connection closed
    /// before resolution. No-op if the entry already resolved.
    pub async fn cancel_wait(&self, waiter_id: u64) {
        let mut capacity = self.capacity.lock().await;
        if let Some(pos) = capacity.queue.iter().position(|w| w.waiter_id == waiter_id) {
            let waiter = capacity.queue.remove(pos);
            drop(capacity);
            if let Some(waiter) = waiter {
                debug!(connection_id = %waiter.connection_id, "queued admission cancelled");
            }
        }
    }

    /// Release a connection's capacity slot and drain the queue head-first
    /// into any freed capacity.
    pub async fn release(&self, connection_id: ConnectionId) {
        let mut capacity = self.capacity.lock().await;
        capacity.active.remove(&connection_id);

        while capacity.active.len() < self.config.max_concurrent {
            let Some(waiter) = capacity.queue.pop_front() else {
                break;
            };
            capacity.active.insert(waiter.connection_id);
            if waiter.tx.send(AdmitOutcome::Admitted).is_err() {
                // Waiter abandoned its ticket; give the slot back and keep
                // draining.
                capacity.active.remove(&waiter.connection_id);
                continue;
            }
            debug!(connection_id = %waiter.connection_id, "queued connection admitted");
        }
    }

    /// Current size of the active connection set.
    pub async fn active_count(&self) -> usize {
        self.capacity.lock().await.active.len()
    }

    /// Current depth of the wait queue.
    pub async fn queue_depth(&self) -> usize {
        self.capacity.lock().await.queue.len()
    }

    // ========================================================================
    // Gate 3: per-identity concurrency
    // ========================================================================

    /// Claim one of the identity's connection slots. Entries older than the
    /// staleness horizon are dropped before counting. Returns false without
    /// mutating state when the identity is already at its cap.
    pub async fn check_concurrency(&self, identity: Identity, connection_id: ConnectionId) -> bool {
        let now = self.clock.now_ms();
        let stale_ms = self.config.connection_stale_after.as_millis() as u64;

        let mut per_identity = self.per_identity.lock().await;
        let connections = per_identity.entry(identity).or_default();
        connections.retain(|c| now.saturating_sub(c.connected_at_ms) < stale_ms);

        if connections.len() >= self.config.max_per_identity {
            warn!(identity = %identity, open = connections.len(), "per-identity connection cap hit");
            return false;
        }
        connections.push(ConnectionInfo {
            connection_id,
            connected_at_ms: now,
        });
        true
    }

    /// Return a connection slot to its identity.
    pub async fn release_identity(&self, identity: Identity, connection_id: ConnectionId) {
        let mut per_identity = self.per_identity.lock().await;
        if let Some(connections) = per_identity.get_mut(&identity) {
            connections.retain(|c| c.connection_id != connection_id);
            if connections.is_empty() {
                per_identity.remove(&identity);
            }
        }
    }

    // ========================================================================
    // Periodic cleanup
    // ========================================================================

    /// Drop aged reconnection entries and stale per-identity connection
    /// info. Called from the orchestrator's periodic sweep.
    pub async fn sweep(&self) {
        let now = self.clock.now_ms();
        let window_ms = self.config.reconnect_window.as_millis() as u64;
        let stale_ms = self.config.connection_stale_after.as_millis() as u64;

        {
            let mut reconnects = self.reconnects.lock().await;
            // Snapshot keys first; LruCache cannot be mutated mid-iteration.
            let aged: Vec<Identity> = reconnects
                .iter()
                .filter(|(_, e)| {
                    now.saturating_sub(e.last_attempt_ms) > window_ms && now >= e.backoff_until_ms
                })
                .map(|(identity, _)| *identity)
                .collect();
            let removed = aged.len();
            for identity in aged {
                reconnects.pop(&identity);
            }
            if removed > 0 {
                debug!(removed, "aged reconnection entries dropped");
            }
        }

        {
            let mut per_identity = self.per_identity.lock().await;
            for connections in per_identity.values_mut() {
                connections.retain(|c| now.saturating_sub(c.connected_at_ms) < stale_ms);
            }
            per_identity.retain(|_, connections| !connections.is_empty());
        }
    }
}
