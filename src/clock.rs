//! Injectable time source.
//!
//! Every temporal algorithm in this crate (fixed windows, reconnection
//! backoff, liveness miss counting, sweep horizons) reads time through the
//! [`Clock`] trait instead of calling the system clock directly. Production
//! code uses [`SystemClock`]; tests use [`ManualClock`] to drive windows and
//! backoff deterministically without real sleeps.
//!
//! Timestamps are milliseconds since the Unix epoch, matching the durable
//! store schema (`window_start`, `blocked_until` are epoch timestamps).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    /// Current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Cloning yields a handle to the same underlying instant, so a test can
/// hold one copy and hand another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at the given epoch timestamp.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute epoch timestamp.
    pub fn set_ms(&self, at_ms: u64) {
        self.now_ms.store(at_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
