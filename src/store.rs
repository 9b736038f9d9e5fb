//! Durable-store trait for admission state.
//!
//! The rate limiter and the escalation tracker are dual-backed: decisions
//! are made from in-process state, while a durable store owned by a
//! collaborator (the persistence layer of the room service) keeps the
//! authoritative copy across process restarts. This module defines the
//! trait boundary and an in-memory implementation used by tests and the
//! demo binary.
//!
//! ## Design
//!
//! The trait is defined separately from its users so that:
//! - the rate limiter depends only on the trait, not on a concrete backend
//! - tests can substitute [`MemoryStore`] or a failure-injecting fake
//!
//! ## Failure semantics
//!
//! Callers treat every method as best-effort. Write failures are logged and
//! swallowed (availability over durability); read failures fall back to the
//! in-memory answer (fail open).

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::escalation::SuspiciousActivityRecord;
use crate::identity::Identity;
use crate::ratelimit::{ActionKind, RateLimitRecord};

/// Durable backing store for rate-limit records and the suspicious-activity
/// log. The two tables are append/overwrite only; nothing in this subsystem
/// reads back free-text details.
#[async_trait]
pub trait AdmissionStore: Send + Sync + 'static {
    /// Insert or overwrite the single live record for (identity, action).
    async fn save_rate_limit(&self, record: RateLimitRecord) -> Result<()>;

    /// Load the live record for (identity, action), if any.
    async fn load_rate_limit(
        &self,
        identity: &Identity,
        action: ActionKind,
    ) -> Result<Option<RateLimitRecord>>;

    /// Remove the record for (identity, action).
    async fn delete_rate_limit(&self, identity: &Identity, action: ActionKind) -> Result<()>;

    /// Delete rate-limit records whose block has lapsed and whose window
    /// started before `window_before_ms`. Returns the number deleted.
    async fn sweep_rate_limits(&self, now_ms: u64, window_before_ms: u64) -> Result<usize>;

    /// Append one suspicious-activity record. Append-only.
    async fn append_activity(&self, record: SuspiciousActivityRecord) -> Result<()>;

    /// Count activity records for `identity` with `at_ms >= since_ms`.
    async fn count_activity_since(&self, identity: &Identity, since_ms: u64) -> Result<usize>;

    /// Bulk retention cleanup: drop activity records older than `before_ms`.
    /// Returns the number deleted.
    async fn prune_activity(&self, before_ms: u64) -> Result<usize>;
}

/// In-memory [`AdmissionStore`] implementation.
///
/// Used as the dependency-injected fake in tests and as the backend of the
/// demo binary. Not durable across restarts, but faithful to the trait
/// contract otherwise.
#[derive(Default)]
pub struct MemoryStore {
    rate_limits: Mutex<HashMap<(Identity, ActionKind), RateLimitRecord>>,
    activity: Mutex<Vec<SuspiciousActivityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rate-limit records. Test introspection.
    pub async fn rate_limit_count(&self) -> usize {
        self.rate_limits.lock().await.len()
    }

    /// Number of activity records. Test introspection.
    pub async fn activity_count(&self) -> usize {
        self.activity.lock().await.len()
    }
}

#[async_trait]
impl AdmissionStore for MemoryStore {
    async fn save_rate_limit(&self, record: RateLimitRecord) -> Result<()> {
        let mut map = self.rate_limits.lock().await;
        map.insert((record.identity, record.action), record);
        Ok(())
    }

    async fn load_rate_limit(
        &self,
        identity: &Identity,
        action: ActionKind,
    ) -> Result<Option<RateLimitRecord>> {
        let map = self.rate_limits.lock().await;
        Ok(map.get(&(*identity, action)).cloned())
    }

    async fn delete_rate_limit(&self, identity: &Identity, action: ActionKind) -> Result<()> {
        let mut map = self.rate_limits.lock().await;
        map.remove(&(*identity, action));
        Ok(())
    }

    async fn sweep_rate_limits(&self, now_ms: u64, window_before_ms: u64) -> Result<usize> {
        let mut map = self.rate_limits.lock().await;
        let before = map.len();
        map.retain(|_, record| {
            let block_active = record
                .blocked_until_ms
                .is_some_and(|until| until > now_ms);
            block_active || record.window_start_ms >= window_before_ms
        });
        Ok(before - map.len())
    }

    async fn append_activity(&self, record: SuspiciousActivityRecord) -> Result<()> {
        self.activity.lock().await.push(record);
        Ok(())
    }

    async fn count_activity_since(&self, identity: &Identity, since_ms: u64) -> Result<usize> {
        let log = self.activity.lock().await;
        Ok(log
            .iter()
            .filter(|r| r.identity == *identity && r.at_ms >= since_ms)
            .count())
    }

    async fn prune_activity(&self, before_ms: u64) -> Result<usize> {
        let mut log = self.activity.lock().await;
        let before = log.len();
        log.retain(|r| r.at_ms >= before_ms);
        Ok(before - log.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::ActivityKind;

    fn record(identity: Identity, action: ActionKind, window_start_ms: u64) -> RateLimitRecord {
        RateLimitRecord {
            identity,
            action,
            attempts: 1,
            window_start_ms,
            blocked_until_ms: None,
        }
    }

    #[tokio::test]
    async fn save_overwrites_single_live_record() {
        let store = MemoryStore::new();
        let id = Identity::from_addr("10.0.0.1");

        store
            .save_rate_limit(record(id, ActionKind::Chat, 100))
            .await
            .unwrap();
        let mut updated = record(id, ActionKind::Chat, 100);
        updated.attempts = 5;
        store.save_rate_limit(updated).await.unwrap();

        assert_eq!(store.rate_limit_count().await, 1);
        let loaded = store
            .load_rate_limit(&id, ActionKind::Chat)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.attempts, 5);
    }

    #[tokio::test]
    async fn sweep_keeps_active_blocks_and_fresh_windows() {
        let store = MemoryStore::new();
        let id = Identity::from_addr("10.0.0.1");

        // Old window, no block: swept.
        store
            .save_rate_limit(record(id, ActionKind::Api, 0))
            .await
            .unwrap();
        // Old window, block still active: kept.
        let mut blocked = record(id, ActionKind::Chat, 0);
        blocked.blocked_until_ms = Some(10_000);
        store.save_rate_limit(blocked).await.unwrap();
        // Fresh window: kept.
        store
            .save_rate_limit(record(id, ActionKind::Join, 5_000))
            .await
            .unwrap();

        let deleted = store.sweep_rate_limits(5_000, 4_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.rate_limit_count().await, 2);
    }

    #[tokio::test]
    async fn activity_count_respects_identity_and_window() {
        let store = MemoryStore::new();
        let a = Identity::from_addr("10.0.0.1");
        let b = Identity::from_addr("10.0.0.2");

        for at_ms in [100, 200, 300] {
            store
                .append_activity(SuspiciousActivityRecord {
                    identity: a,
                    kind: ActivityKind::RateLimitExceeded,
                    details: String::new(),
                    at_ms,
                })
                .await
                .unwrap();
        }
        store
            .append_activity(SuspiciousActivityRecord {
                identity: b,
                kind: ActivityKind::RapidReconnection,
                details: String::new(),
                at_ms: 250,
            })
            .await
            .unwrap();

        assert_eq!(store.count_activity_since(&a, 0).await.unwrap(), 3);
        assert_eq!(store.count_activity_since(&a, 200).await.unwrap(), 2);
        assert_eq!(store.count_activity_since(&b, 0).await.unwrap(), 1);

        let deleted = store.prune_activity(250).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.activity_count().await, 2);
    }
}
