//! # Per-Identity Rate Limiter
//!
//! Fixed-window counters keyed by (identity, action kind), with per-action
//! thresholds and block durations. The limiter is dual-backed:
//!
//! - An LRU cache answers every check with in-process latency.
//! - A durable store keeps the authoritative copy across restarts: on a
//!   cache miss the store is consulted before a fresh window is started, so
//!   a restart does not silently un-block anyone.
//!
//! ## Persistence
//!
//! Writes go through a bounded queue drained by a background task. A failed
//! or dropped persist never fails the check that produced it — the
//! in-memory decision stays authoritative for the current process. This is
//! an explicit availability-over-durability tradeoff.
//!
//! ## Invariants
//!
//! - An active block (`blocked_until > now`) denies unconditionally; the
//!   attempt counter is not consulted.
//! - Exactly one live record exists per (identity, action) pair; checks
//!   overwrite it, never append.
//! - A check strictly after `blocked_until` starts a fresh window.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::escalation::{ActivityKind, EscalationTracker};
use crate::identity::Identity;
use crate::store::AdmissionStore;

/// Maximum (identity, action) records held in the in-process cache.
/// Uses LRU eviction when full; evicted records survive in the store.
const MAX_CACHED_RECORDS: usize = 100_000;

/// Depth of the background persistence queue. When full, writes are
/// dropped with a warning rather than blocking the decision path.
const PERSIST_QUEUE_DEPTH: usize = 256;

/// Action kinds subject to rate limiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Generic API request.
    Api,
    /// Chat message inside a room.
    Chat,
    /// Room join attempt.
    Join,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Api, ActionKind::Chat, ActionKind::Join];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api_request",
            Self::Chat => "chat_message",
            Self::Join => "join_attempt",
        }
    }
}

/// Thresholds for one action kind.
#[derive(Clone, Copy, Debug)]
pub struct ActionPolicy {
    /// Attempts allowed inside one window.
    pub max_attempts: u32,
    /// Window length.
    pub window: Duration,
    /// Block imposed when the window is exhausted.
    pub block: Duration,
}

/// Data-driven per-action policy table.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub api: ActionPolicy,
    pub chat: ActionPolicy,
    pub join: ActionPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api: ActionPolicy {
                max_attempts: 100,
                window: Duration::from_secs(60),
                block: Duration::from_secs(60),
            },
            chat: ActionPolicy {
                max_attempts: 10,
                window: Duration::from_secs(60),
                block: Duration::from_secs(30),
            },
            join: ActionPolicy {
                max_attempts: 5,
                window: Duration::from_secs(60),
                block: Duration::from_secs(300),
            },
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self, action: ActionKind) -> ActionPolicy {
        match action {
            ActionKind::Api => self.api,
            ActionKind::Chat => self.chat,
            ActionKind::Join => self.join,
        }
    }

    /// Longest configured window; the sweep retention horizon.
    pub fn longest_window(&self) -> Duration {
        ActionKind::ALL
            .iter()
            .map(|a| self.policy(*a).window)
            .max()
            .unwrap_or(Duration::from_secs(60))
    }
}

/// The single live record for one (identity, action) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub identity: Identity,
    pub action: ActionKind,
    /// Attempts observed in the current window.
    pub attempts: u32,
    /// Epoch timestamp the current window began.
    pub window_start_ms: u64,
    /// Active block, if any. When set and in the future, `attempts` is
    /// not consulted.
    pub blocked_until_ms: Option<u64>,
}

impl RateLimitRecord {
    fn fresh(identity: Identity, action: ActionKind, now_ms: u64) -> Self {
        Self {
            identity,
            action,
            attempts: 0,
            window_start_ms: now_ms,
            blocked_until_ms: None,
        }
    }

    fn block_active(&self, now_ms: u64) -> bool {
        self.blocked_until_ms.is_some_and(|until| until > now_ms)
    }
}

/// Outcome of one rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        /// Maximum attempts for this action's window.
        limit: u32,
        /// Attempts left in the current window.
        remaining: u32,
        /// Epoch timestamp the window resets.
        reset_at_ms: u64,
    },
    Blocked {
        /// Epoch timestamp the block lapses.
        blocked_until_ms: u64,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Whole seconds until a blocked identity may retry, rounded up.
    /// Zero for allowed decisions.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        match self {
            Self::Allowed { .. } => 0,
            Self::Blocked { blocked_until_ms } => {
                blocked_until_ms.saturating_sub(now_ms).div_ceil(1000)
            }
        }
    }
}

enum PersistOp {
    Save(RateLimitRecord),
    Delete(Identity, ActionKind),
}

/// Fixed-window rate limiter, dual-backed by cache and durable store.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    store: Arc<dyn AdmissionStore>,
    escalation: Arc<EscalationTracker>,
    cache: Mutex<LruCache<(Identity, ActionKind), RateLimitRecord>>,
    persist_tx: mpsc::Sender<PersistOp>,
}

impl RateLimiter {
    /// Create the limiter and spawn its background persistence task.
    pub fn new(
        config: RateLimitConfig,
        clock: SharedClock,
        store: Arc<dyn AdmissionStore>,
        escalation: Arc<EscalationTracker>,
    ) -> Self {
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE_DEPTH);
        tokio::spawn(persist_worker(store.clone(), persist_rx));

        Self {
            config,
            clock,
            store,
            escalation,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_RECORDS).expect("cache bound"),
            )),
            persist_tx,
        }
    }

    /// Check and count one attempt for (identity, action).
    ///
    /// Implements the four-step window algorithm: active block short-circuit,
    /// window refresh, threshold transition to blocked, then increment.
    pub async fn check(&self, identity: Identity, action: ActionKind) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let policy = self.config.policy(action);
        let key = (identity, action);

        let mut cache = self.cache.lock().await;
        let mut record = match cache.get(&key) {
            Some(record) => record.clone(),
            // Cache miss: the store is authoritative for blocks that
            // predate this process. A failed read falls back to a fresh
            // window (fail open).
            None => match self.store.load_rate_limit(&identity, action).await {
                Ok(Some(record)) => record,
                Ok(None) => RateLimitRecord::fresh(identity, action, now),
                Err(e) => {
                    warn!(identity = %identity, action = action.as_str(), error = %e,
                        "rate limit load failed, failing open");
                    RateLimitRecord::fresh(identity, action, now)
                }
            },
        };

        // Step 1: active block denies unconditionally.
        if record.block_active(now) {
            let blocked_until_ms = record.blocked_until_ms.unwrap_or(now);
            cache.put(key, record);
            return RateLimitDecision::Blocked { blocked_until_ms };
        }

        // Step 2: stale window (or lapsed block) starts fresh.
        let window_ms = policy.window.as_millis() as u64;
        if record.blocked_until_ms.is_some()
            || now.saturating_sub(record.window_start_ms) >= window_ms
        {
            record = RateLimitRecord::fresh(identity, action, now);
        }

        // Step 3: exhausted window transitions to blocked.
        if record.attempts >= policy.max_attempts {
            let blocked_until_ms = now + policy.block.as_millis() as u64;
            record.blocked_until_ms = Some(blocked_until_ms);
            cache.put(key, record.clone());
            drop(cache);

            self.enqueue_persist(PersistOp::Save(record));
            self.escalation
                .record(
                    identity,
                    ActivityKind::RateLimitExceeded,
                    format!(
                        "{} exceeded {} attempts per window",
                        action.as_str(),
                        policy.max_attempts
                    ),
                )
                .await;
            warn!(identity = %identity, action = action.as_str(), blocked_until_ms,
                "rate limit exceeded, block started");
            return RateLimitDecision::Blocked { blocked_until_ms };
        }

        // Step 4: count the attempt.
        record.attempts += 1;
        let remaining = policy.max_attempts - record.attempts;
        let reset_at_ms = record.window_start_ms + window_ms;
        cache.put(key, record.clone());
        drop(cache);

        self.enqueue_persist(PersistOp::Save(record));
        RateLimitDecision::Allowed {
            limit: policy.max_attempts,
            remaining,
            reset_at_ms,
        }
    }

    /// Impose a block immediately, without waiting for the counter to reach
    /// its threshold. Used when a caller has decided through another path
    /// that a violation occurred.
    pub async fn record_violation(&self, identity: Identity, action: ActionKind) {
        let now = self.clock.now_ms();
        let policy = self.config.policy(action);
        let blocked_until_ms = now + policy.block.as_millis() as u64;

        let key = (identity, action);
        let mut cache = self.cache.lock().await;
        let mut record = cache
            .get(&key)
            .cloned()
            .unwrap_or_else(|| RateLimitRecord::fresh(identity, action, now));
        record.blocked_until_ms = Some(blocked_until_ms);
        cache.put(key, record.clone());
        drop(cache);

        self.enqueue_persist(PersistOp::Save(record));
        self.escalation
            .record(
                identity,
                ActivityKind::RateLimitExceeded,
                format!("explicit violation for {}", action.as_str()),
            )
            .await;
        warn!(identity = %identity, action = action.as_str(), "explicit violation recorded");
    }

    /// Administrative/testing override: forget all state for the pair.
    pub async fn reset(&self, identity: Identity, action: ActionKind) {
        let mut cache = self.cache.lock().await;
        cache.pop(&(identity, action));
        drop(cache);
        self.enqueue_persist(PersistOp::Delete(identity, action));
    }

    /// Read-only introspection of the live record, if any. Does not touch
    /// counters or LRU order.
    pub async fn status(&self, identity: Identity, action: ActionKind) -> Option<RateLimitRecord> {
        let cache = self.cache.lock().await;
        if let Some(record) = cache.peek(&(identity, action)) {
            return Some(record.clone());
        }
        drop(cache);
        match self.store.load_rate_limit(&identity, action).await {
            Ok(record) => record,
            Err(e) => {
                warn!(identity = %identity, error = %e, "rate limit status read failed");
                None
            }
        }
    }

    /// Remove cached and durable records whose block has lapsed and whose
    /// window is older than the longest configured window.
    pub async fn sweep_expired(&self) {
        let now = self.clock.now_ms();
        let horizon = now.saturating_sub(self.config.longest_window().as_millis() as u64);

        let mut cache = self.cache.lock().await;
        // Snapshot keys first; LruCache cannot be mutated mid-iteration.
        let stale: Vec<(Identity, ActionKind)> = cache
            .iter()
            .filter(|(_, record)| {
                !record.block_active(now) && record.window_start_ms < horizon
            })
            .map(|(key, _)| *key)
            .collect();
        let cached_removed = stale.len();
        for key in stale {
            cache.pop(&key);
        }
        drop(cache);

        match self.store.sweep_rate_limits(now, horizon).await {
            Ok(stored_removed) => {
                if cached_removed > 0 || stored_removed > 0 {
                    debug!(cached_removed, stored_removed, "rate limit sweep complete");
                }
            }
            Err(e) => warn!(error = %e, "durable rate limit sweep failed"),
        }
    }

    /// Queue a store write without blocking the decision path. A full queue
    /// drops the write with a warning.
    fn enqueue_persist(&self, op: PersistOp) {
        if self.persist_tx.try_send(op).is_err() {
            warn!("persistence queue full, dropping rate limit write");
        }
    }
}

/// Background task draining the persistence queue. Failures are logged and
/// swallowed; the in-memory decision already stands.
async fn persist_worker(store: Arc<dyn AdmissionStore>, mut rx: mpsc::Receiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        let result = match &op {
            PersistOp::Save(record) => store.save_rate_limit(record.clone()).await,
            PersistOp::Delete(identity, action) => {
                store.delete_rate_limit(identity, *action).await
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "rate limit persistence failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;

    use anyhow::Result;
    use async_trait::async_trait;
    use crate::escalation::SuspiciousActivityRecord;

    /// Store whose every method fails, for fail-open tests.
    struct BrokenStore;

    #[async_trait]
    impl AdmissionStore for BrokenStore {
        async fn save_rate_limit(&self, _: RateLimitRecord) -> Result<()> {
            anyhow::bail!("store unavailable")
        }
        async fn load_rate_limit(
            &self,
            _: &Identity,
            _: ActionKind,
        ) -> Result<Option<RateLimitRecord>> {
            anyhow::bail!("store unavailable")
        }
        async fn delete_rate_limit(&self, _: &Identity, _: ActionKind) -> Result<()> {
            anyhow::bail!("store unavailable")
        }
        async fn sweep_rate_limits(&self, _: u64, _: u64) -> Result<usize> {
            anyhow::bail!("store unavailable")
        }
        async fn append_activity(&self, _: SuspiciousActivityRecord) -> Result<()> {
            anyhow::bail!("store unavailable")
        }
        async fn count_activity_since(&self, _: &Identity, _: u64) -> Result<usize> {
            anyhow::bail!("store unavailable")
        }
        async fn prune_activity(&self, _: u64) -> Result<usize> {
            anyhow::bail!("store unavailable")
        }
    }

    fn limiter_with(
        store: Arc<dyn AdmissionStore>,
    ) -> (RateLimiter, ManualClock, Arc<EscalationTracker>) {
        let clock = ManualClock::new(1_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let escalation = Arc::new(EscalationTracker::new(shared.clone(), store.clone()));
        let limiter = RateLimiter::new(
            RateLimitConfig::default(),
            shared,
            store,
            escalation.clone(),
        );
        (limiter, clock, escalation)
    }

    #[tokio::test]
    async fn allows_up_to_max_attempts_then_blocks() {
        let (limiter, clock, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        for i in 0..10 {
            let decision = limiter.check(id, ActionKind::Chat).await;
            match decision {
                RateLimitDecision::Allowed { remaining, limit, .. } => {
                    assert_eq!(limit, 10);
                    assert_eq!(remaining, 10 - (i + 1));
                }
                RateLimitDecision::Blocked { .. } => panic!("attempt {i} should be allowed"),
            }
        }

        let denied = limiter.check(id, ActionKind::Chat).await;
        match denied {
            RateLimitDecision::Blocked { blocked_until_ms } => {
                assert!(blocked_until_ms > clock.now_ms());
                assert_eq!(blocked_until_ms, clock.now_ms() + 30_000);
            }
            RateLimitDecision::Allowed { .. } => panic!("11th chat attempt should block"),
        }
    }

    #[tokio::test]
    async fn active_block_denies_without_counting() {
        let (limiter, clock, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        for _ in 0..6 {
            limiter.check(id, ActionKind::Join).await;
        }
        let blocked_until = match limiter.status(id, ActionKind::Join).await {
            Some(record) => record.blocked_until_ms.expect("block should be set"),
            None => panic!("record should exist"),
        };

        // Hammering during the block never moves blocked_until.
        for _ in 0..50 {
            clock.advance(Duration::from_secs(1));
            match limiter.check(id, ActionKind::Join).await {
                RateLimitDecision::Blocked { blocked_until_ms } => {
                    assert_eq!(blocked_until_ms, blocked_until);
                }
                RateLimitDecision::Allowed { .. } => panic!("should stay blocked"),
            }
        }
    }

    #[tokio::test]
    async fn fresh_window_after_block_lapses() {
        let (limiter, clock, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        for _ in 0..11 {
            limiter.check(id, ActionKind::Chat).await;
        }
        clock.advance(Duration::from_secs(31));

        match limiter.check(id, ActionKind::Chat).await {
            RateLimitDecision::Allowed { remaining, .. } => assert_eq!(remaining, 9),
            RateLimitDecision::Blocked { .. } => panic!("block lapsed, should allow"),
        }
    }

    #[tokio::test]
    async fn window_resets_after_window_length() {
        let (limiter, clock, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        for _ in 0..9 {
            limiter.check(id, ActionKind::Chat).await;
        }
        clock.advance(Duration::from_secs(60));

        match limiter.check(id, ActionKind::Chat).await {
            RateLimitDecision::Allowed { remaining, reset_at_ms, .. } => {
                assert_eq!(remaining, 9);
                assert_eq!(reset_at_ms, clock.now_ms() + 60_000);
            }
            RateLimitDecision::Blocked { .. } => panic!("new window should allow"),
        }
    }

    #[tokio::test]
    async fn block_survives_cache_loss_via_store() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let (limiter, _, _) = limiter_with(store.clone());
        let id = Identity::from_addr("10.0.0.1");

        for _ in 0..11 {
            limiter.check(id, ActionKind::Chat).await;
        }
        // Let the persistence queue drain.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A second limiter over the same store simulates a restart with a
        // cold cache. The persisted block must still deny.
        let (restarted, _, _) = limiter_with(store);
        match restarted.check(id, ActionKind::Chat).await {
            RateLimitDecision::Blocked { .. } => {}
            RateLimitDecision::Allowed { .. } => panic!("persisted block must survive restart"),
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let (limiter, _, _) = limiter_with(Arc::new(BrokenStore));
        let id = Identity::from_addr("10.0.0.1");

        match limiter.check(id, ActionKind::Api).await {
            RateLimitDecision::Allowed { remaining, .. } => assert_eq!(remaining, 99),
            RateLimitDecision::Blocked { .. } => panic!("broken store must not deny"),
        }
    }

    #[tokio::test]
    async fn explicit_violation_blocks_immediately() {
        let (limiter, clock, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        limiter.record_violation(id, ActionKind::Join).await;
        match limiter.check(id, ActionKind::Join).await {
            RateLimitDecision::Blocked { blocked_until_ms } => {
                assert_eq!(blocked_until_ms, clock.now_ms() + 300_000);
            }
            RateLimitDecision::Allowed { .. } => panic!("explicit violation should block"),
        }
    }

    #[tokio::test]
    async fn reset_clears_block() {
        let (limiter, _, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        limiter.record_violation(id, ActionKind::Chat).await;
        limiter.reset(id, ActionKind::Chat).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(limiter.check(id, ActionKind::Chat).await.is_allowed());
    }

    #[tokio::test]
    async fn threshold_crossing_feeds_escalation() {
        let (limiter, _, escalation) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        for _ in 0..11 {
            limiter.check(id, ActionKind::Chat).await;
        }
        assert_eq!(
            escalation
                .count_since(&id, crate::escalation::ESCALATION_WINDOW)
                .await,
            1
        );
    }

    #[tokio::test]
    async fn sweep_drops_stale_unblocked_records() {
        let store = Arc::new(MemoryStore::new());
        let (limiter, clock, _) = limiter_with(store.clone());
        let id = Identity::from_addr("10.0.0.1");

        limiter.check(id, ActionKind::Api).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.rate_limit_count().await, 1);

        clock.advance(Duration::from_secs(61));
        limiter.sweep_expired().await;
        assert_eq!(store.rate_limit_count().await, 0);
        assert!(limiter.status(id, ActionKind::Api).await.is_none());
    }

    #[tokio::test]
    async fn actions_are_limited_independently() {
        let (limiter, _, _) = limiter_with(Arc::new(MemoryStore::new()));
        let id = Identity::from_addr("10.0.0.1");

        for _ in 0..11 {
            limiter.check(id, ActionKind::Chat).await;
        }
        assert!(!limiter.check(id, ActionKind::Chat).await.is_allowed());
        assert!(limiter.check(id, ActionKind::Api).await.is_allowed());
        assert!(limiter.check(id, ActionKind::Join).await.is_allowed());
    }
}
