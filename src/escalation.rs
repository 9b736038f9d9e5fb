//! # Abuse Escalation Tracker
//!
//! Records discrete violation events per identity and promotes repeat
//! offenders to a permanent block. The tracker is advisory: it answers
//! "should this identity be permanently blocked?" and leaves acting on the
//! answer to the session orchestrator.
//!
//! ## State
//!
//! - An in-memory per-identity window of event timestamps, LRU-bounded so
//!   untrusted actors cannot grow it without bound.
//! - An append-only durable log ([`SuspiciousActivityRecord`]) for audit
//!   and for counting across process restarts.
//!
//! ## Failure semantics
//!
//! `record` never fails its caller: a failed durable append is logged and
//! swallowed. Counting prefers the durable log and falls back to the
//! in-memory window if the store read fails (fail open).

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::identity::Identity;
use crate::store::AdmissionStore;

/// Trailing window over which violations count toward escalation.
pub const ESCALATION_WINDOW: Duration = Duration::from_secs(60 * 60);

/// More than this many violations inside [`ESCALATION_WINDOW`] promotes the
/// identity to a permanent block.
pub const PERMANENT_BLOCK_THRESHOLD: usize = 10;

/// Maximum identities tracked in the in-memory window.
/// Uses LRU eviction when full; the durable log is unaffected.
const MAX_TRACKED_IDENTITIES: usize = 10_000;

/// Kind of suspicious activity being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    /// A rate-limit threshold was crossed.
    RateLimitExceeded,
    /// Rapid reconnection attempts triggered backoff.
    RapidReconnection,
    /// The escalation threshold itself was crossed.
    MultipleBlocks,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::RapidReconnection => "rapid_reconnection",
            Self::MultipleBlocks => "multiple_blocks",
        }
    }
}

/// One append-only entry in the suspicious-activity log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuspiciousActivityRecord {
    pub identity: Identity,
    pub kind: ActivityKind,
    pub details: String,
    pub at_ms: u64,
}

/// Tracks violations per identity and decides on permanent blocks.
pub struct EscalationTracker {
    clock: SharedClock,
    store: Arc<dyn AdmissionStore>,
    recent: Mutex<LruCache<Identity, VecDeque<u64>>>,
}

impl EscalationTracker {
    pub fn new(clock: SharedClock, store: Arc<dyn AdmissionStore>) -> Self {
        Self {
            clock,
            store,
            recent: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_IDENTITIES).expect("tracked identities bound"),
            )),
        }
    }

    /// Record one violation event. Never fails the caller; durable append
    /// errors are logged and swallowed.
    pub async fn record(&self, identity: Identity, kind: ActivityKind, details: impl Into<String>) {
        let now = self.clock.now_ms();
        let window_ms = ESCALATION_WINDOW.as_millis() as u64;

        {
            let mut recent = self.recent.lock().await;
            let events = recent.get_or_insert_mut(identity, VecDeque::new);
            while events
                .front()
                .is_some_and(|at| now.saturating_sub(*at) > window_ms)
            {
                events.pop_front();
            }
            events.push_back(now);
        }

        let record = SuspiciousActivityRecord {
            identity,
            kind,
            details: details.into(),
            at_ms: now,
        };
        debug!(identity = %identity, kind = kind.as_str(), "suspicious activity recorded");
        if let Err(e) = self.store.append_activity(record).await {
            warn!(identity = %identity, error = %e, "failed to persist activity record");
        }
    }

    /// Count violations for `identity` inside the trailing `window`.
    ///
    /// Prefers the durable log (authoritative across restarts); falls back
    /// to the in-memory window when the store read fails.
    pub async fn count_since(&self, identity: &Identity, window: Duration) -> usize {
        let now = self.clock.now_ms();
        let since = now.saturating_sub(window.as_millis() as u64);

        match self.store.count_activity_since(identity, since).await {
            Ok(count) => count,
            Err(e) => {
                warn!(identity = %identity, error = %e, "activity count read failed, using in-memory window");
                let mut recent = self.recent.lock().await;
                recent
                    .get(identity)
                    .map(|events| events.iter().filter(|at| **at >= since).count())
                    .unwrap_or(0)
            }
        }
    }

    /// True when the identity has crossed the permanent-block threshold
    /// inside the trailing hour.
    ///
    /// Returning true records one more `MultipleBlocks` event, so repeated
    /// checks keep the counter above the threshold until the window ages
    /// entries out; callers need no external deduplication.
    pub async fn should_permanently_block(&self, identity: &Identity) -> bool {
        let count = self.count_since(identity, ESCALATION_WINDOW).await;
        if count > PERMANENT_BLOCK_THRESHOLD {
            self.record(
                *identity,
                ActivityKind::MultipleBlocks,
                format!("{count} violations within escalation window"),
            )
            .await;
            warn!(identity = %identity, count, "identity escalated to permanent block");
            return true;
        }
        false
    }

    /// Drop in-memory window entries that have fully aged out, and apply
    /// retention cleanup to the durable log. Called from the periodic sweep.
    pub async fn sweep(&self) {
        let now = self.clock.now_ms();
        let window_ms = ESCALATION_WINDOW.as_millis() as u64;

        {
            let mut recent = self.recent.lock().await;
            // Snapshot keys first; LruCache cannot be mutated mid-iteration.
            let stale: Vec<Identity> = recent
                .iter()
                .filter(|(_, events)| {
                    events
                        .back()
                        .is_none_or(|at| now.saturating_sub(*at) > window_ms)
                })
                .map(|(identity, _)| *identity)
                .collect();
            for identity in stale {
                recent.pop(&identity);
            }
        }

        match self
            .store
            .prune_activity(now.saturating_sub(window_ms))
            .await
        {
            Ok(deleted) if deleted > 0 => {
                debug!(deleted, "pruned aged activity records");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "activity retention cleanup failed"),
        }
    }
}
