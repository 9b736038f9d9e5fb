//! # Roomgate - Connection Admission and Rate Limiting
//!
//! Roomgate protects a multi-tenant real-time room service from abusive
//! traffic. It decides who may connect, how fast they may act once
//! connected, and whether they are still alive:
//!
//! - **Admission**: system-wide capacity cap with a FIFO wait queue,
//!   per-identity concurrency cap, and exponential backoff against
//!   reconnection storms
//! - **Rate limiting**: fixed-window counters per (identity, action) with
//!   temporary blocks on violation
//! - **Escalation**: repeat offenders inside a sliding window graduate to
//!   a permanent block
//! - **Liveness**: heartbeat probes with termination after consecutive
//!   misses
//!
//! ## Architecture
//!
//! State that needs sequential processing (liveness) lives behind the
//! **Actor Pattern**: a public cloneable handle talks to a private actor
//! over an async channel. Shared counters (admission, rate limits) live
//! behind async mutexes with bounded LRU maps, so a hostile client cannot
//! grow memory without bound. Durable state goes through the injected
//! [`AdmissionStore`] trait; reads fail open and writes fail silent, so a
//! store outage degrades protection rather than availability.
//!
//! Time is injected through the [`Clock`] trait; production uses the
//! system clock and tests drive a manual one.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `gate` | Session orchestrator combining all gates |
//! | `identity` | Hash-derived client identities (32 bytes) |
//! | `admission` | Capacity queue, concurrency cap, reconnection backoff |
//! | `ratelimit` | Fixed-window rate limiter with write-behind persistence |
//! | `escalation` | Suspicious-activity tracking and permanent blocks |
//! | `liveness` | Heartbeat monitor actor |
//! | `events` | Serializable channel events and deny codes |
//! | `store` | Durable-store trait and in-memory implementation |
//! | `clock` | Injectable time source |

mod admission;
mod clock;
mod escalation;
mod events;
mod gate;
mod identity;
mod liveness;
mod ratelimit;
mod store;

pub use admission::{AdmissionConfig, BackoffDecision, ConnectionId};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use escalation::{ActivityKind, EscalationTracker, SuspiciousActivityRecord};
pub use events::{
    ClientEvent, DenyCode, MAX_EVENT_SIZE, RateLimitInfo, ServerEvent, deserialize_event,
    serialize_event,
};
pub use gate::{
    ActionDecision, ConnectOutcome, GateConfig, GateTelemetry, Gatekeeper, OutboundEvent,
    PendingAdmission,
};
pub use identity::Identity;
pub use liveness::{LivenessEvent, LivenessMonitor};
pub use ratelimit::{
    ActionKind, ActionPolicy, RateLimitConfig, RateLimitDecision, RateLimitRecord, RateLimiter,
};
pub use store::{AdmissionStore, MemoryStore};
