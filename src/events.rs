//! # Real-Time Channel Events
//!
//! Serializable types crossing the boundary between this subsystem and the
//! real-time transport. Events are serialized with bincode under a size
//! limit, so a malicious frame cannot force a large allocation during
//! decode.
//!
//! | Direction | Type | Purpose |
//! |-----------|------|---------|
//! | outbound | [`ServerEvent::Ping`] | heartbeat probe (no payload) |
//! | outbound | [`ServerEvent::Error`] | denial with machine-readable code |
//! | outbound | [`ServerEvent::Queued`] | capacity-queue notice |
//! | inbound | [`ClientEvent::Pong`] | heartbeat acknowledgment |
//!
//! Deny codes serialize as stable SCREAMING_SNAKE strings; HTTP-style
//! callers map them onto 429-class responses with a `Retry-After` header.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::ratelimit::ActionKind;

/// Maximum size of an encoded channel event.
/// SECURITY: bounds decode allocations; events are tiny in practice.
pub const MAX_EVENT_SIZE: u64 = 4096;

/// Machine-readable denial codes surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenyCode {
    /// Permanent escalation block.
    IpBlocked,
    /// Reconnection-storm backoff active.
    ReconnectionThrottled,
    /// Process-wide connection cap reached and the queue wait lapsed.
    SystemAtCapacity,
    /// Per-identity concurrency cap reached.
    TooManyConnections,
    /// Terminated by the liveness monitor.
    ConnectionTimeout,
    /// Generic API rate limit.
    RateLimitExceeded,
    /// Join-attempt rate limit.
    JoinLimitExceeded,
    /// Chat-message rate limit.
    ChatRateLimitExceeded,
    /// Missing identity/connection context; a caller bug, not abuse.
    InvalidRequest,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpBlocked => "IP_BLOCKED",
            Self::ReconnectionThrottled => "RECONNECTION_THROTTLED",
            Self::SystemAtCapacity => "SYSTEM_AT_CAPACITY",
            Self::TooManyConnections => "TOO_MANY_CONNECTIONS",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::JoinLimitExceeded => "JOIN_LIMIT_EXCEEDED",
            Self::ChatRateLimitExceeded => "CHAT_RATE_LIMIT_EXCEEDED",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }

    /// The code used when the given action's rate limit denies.
    pub fn for_action(action: ActionKind) -> Self {
        match action {
            ActionKind::Api => Self::RateLimitExceeded,
            ActionKind::Chat => Self::ChatRateLimitExceeded,
            ActionKind::Join => Self::JoinLimitExceeded,
        }
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events sent from the service to a client over the real-time channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Heartbeat probe. No payload; the client answers with `Pong`.
    Ping,
    /// A denial or termination notice.
    Error {
        code: DenyCode,
        message: String,
        /// Retry hint in whole seconds, rounded up. Absent for terminal
        /// denials.
        retry_after_secs: Option<u64>,
    },
    /// The connection is queued behind the capacity gate.
    Queued {
        message: String,
        /// 1-based position at enqueue time.
        queue_position: usize,
    },
}

/// Events received from a client over the real-time channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Heartbeat acknowledgment. No payload.
    Pong,
}

/// Informational headers attached to successful rate-limit checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch timestamp the current window resets.
    pub reset_at_ms: u64,
}

impl RateLimitInfo {
    /// Render as HTTP-style informational headers. The reset header is
    /// epoch seconds, matching the conventional `X-RateLimit-Reset` unit.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", (self.reset_at_ms / 1000).to_string()),
        ]
    }
}

/// Returns bincode options with the event size limit enforced.
/// SECURITY: always use this for decoding; never raw `bincode::deserialize`.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_EVENT_SIZE)
        .with_fixint_encoding()
}

pub fn serialize_event<T: Serialize>(event: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(event)
}

/// Decode with the size bound enforced.
pub fn deserialize_event<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}
