//! # Session Orchestrator
//!
//! The [`Gatekeeper`] composes the admission gates, the rate limiter, the
//! escalation tracker and the liveness monitor into the single decision
//! surface the room service calls at connection time and on every
//! rate-sensitive event.
//!
//! ## Connection pipeline
//!
//! 1. Permanent-block check (escalation tracker)
//! 2. Reconnection-storm backoff
//! 3. System-wide capacity (admit or queue)
//! 4. Per-identity concurrency cap
//!
//! A connection passing all four gates is registered with the liveness
//! monitor and tracked in the session map. Every denial carries a
//! machine-readable [`DenyCode`] and, where retrying makes sense, a
//! `Retry-After` hint in whole seconds.
//!
//! ## Background work
//!
//! Two tasks run for the gatekeeper's lifetime: a pump translating
//! liveness events into outbound channel events (and departure cleanup for
//! terminations), and a periodic sweep aging out rate-limit records,
//! reconnection entries, stale connection info and old activity records.
//! Both hold only weak references, so dropping the gatekeeper stops them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::{
    Admission, AdmissionConfig, AdmissionController, AdmissionTicket, AdmitOutcome,
    BackoffDecision, ConnectionId,
};
use crate::clock::SharedClock;
use crate::escalation::EscalationTracker;
use crate::events::{DenyCode, RateLimitInfo, ServerEvent};
use crate::identity::Identity;
use crate::liveness::{LivenessEvent, LivenessMonitor};
use crate::ratelimit::{ActionKind, RateLimitConfig, RateLimitDecision, RateLimiter};
use crate::store::AdmissionStore;

/// Interval of the periodic cleanup sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Gatekeeper tunables. Defaults match production policy.
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub admission: AdmissionConfig,
    pub ratelimit: RateLimitConfig,
    /// Liveness probe period.
    pub heartbeat_interval: Duration,
    /// Periodic cleanup interval.
    pub sweep_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            ratelimit: RateLimitConfig::default(),
            heartbeat_interval: crate::liveness::DEFAULT_HEARTBEAT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Result of a connection attempt.
pub enum ConnectOutcome {
    /// All gates passed; the connection is live.
    Admitted {
        connection_id: ConnectionId,
        identity: Identity,
    },
    /// At capacity; the caller should notify the client and then resolve
    /// the pending admission via [`Gatekeeper::resolve_queued`].
    Queued {
        /// 1-based position at enqueue time.
        queue_position: usize,
        pending: PendingAdmission,
    },
    /// Denied at one of the gates.
    Denied {
        code: DenyCode,
        message: String,
        retry_after_secs: Option<u64>,
    },
}

impl ConnectOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    fn denied(code: DenyCode, message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self::Denied {
            code,
            message: message.into(),
            retry_after_secs,
        }
    }
}

/// A connection parked in the capacity queue, waiting for a slot.
pub struct PendingAdmission {
    connection_id: ConnectionId,
    identity: Identity,
    ticket: AdmissionTicket,
}

impl PendingAdmission {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

/// Result of a rate-sensitive action check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionDecision {
    /// Allowed; attach these informational headers.
    Allowed { info: RateLimitInfo },
    /// Denied; map onto a 429-class response.
    Denied {
        code: DenyCode,
        message: String,
        retry_after_secs: u64,
    },
}

impl ActionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Outbound event addressed to one connection's real-time channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundEvent {
    pub connection_id: ConnectionId,
    pub event: ServerEvent,
}

/// Snapshot of the gatekeeper's live state, for telemetry logging.
#[derive(Clone, Copy, Debug)]
pub struct GateTelemetry {
    pub active_connections: usize,
    pub queue_depth: usize,
    pub live_sessions: usize,
}

struct Session {
    identity: Identity,
    connected_at_ms: u64,
}

/// The session orchestrator. All state is explicitly owned here; there are
/// no ambient globals, and the durable store is injected.
pub struct Gatekeeper {
    clock: SharedClock,
    ratelimiter: RateLimiter,
    escalation: Arc<EscalationTracker>,
    admission: Arc<AdmissionController>,
    liveness: LivenessMonitor,
    sessions: Mutex<HashMap<ConnectionId, Session>>,
    event_tx: mpsc::Sender<OutboundEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Gatekeeper {
    /// Build the gatekeeper and spawn its background tasks. Returns the
    /// handle and the receiver for outbound channel events (heartbeat
    /// probes and termination notices).
    pub fn spawn(
        config: GateConfig,
        store: Arc<dyn AdmissionStore>,
        clock: SharedClock,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundEvent>) {
        let escalation = Arc::new(EscalationTracker::new(clock.clone(), store.clone()));
        let ratelimiter = RateLimiter::new(
            config.ratelimit.clone(),
            clock.clone(),
            store,
            escalation.clone(),
        );
        let admission =
            AdmissionController::new(config.admission.clone(), clock.clone(), escalation.clone());
        let (liveness, liveness_rx) =
            LivenessMonitor::spawn(config.heartbeat_interval, clock.clone());

        let (event_tx, event_rx) = mpsc::channel(256);

        let gate = Arc::new(Self {
            clock,
            ratelimiter,
            escalation,
            admission,
            liveness,
            sessions: Mutex::new(HashMap::new()),
            event_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(liveness_pump(Arc::downgrade(&gate), liveness_rx));
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&gate), config.sweep_interval));
        gate.tasks
            .lock()
            .expect("task list lock")
            .extend([pump, sweeper]);

        (gate, event_rx)
    }

    /// Run a new connection attempt through every admission gate.
    pub async fn connect(self: &Arc<Self>, raw_addr: &str) -> ConnectOutcome {
        let raw_addr = raw_addr.trim();
        if raw_addr.is_empty() {
            // Missing context is a caller bug; deny rather than crash.
            return ConnectOutcome::denied(
                DenyCode::InvalidRequest,
                "connection request without a source address",
                None,
            );
        }
        let identity = Identity::from_addr(raw_addr);

        // Gate 0: permanent escalation block.
        if self.escalation.should_permanently_block(&identity).await {
            return ConnectOutcome::denied(
                DenyCode::IpBlocked,
                "address permanently blocked for repeated abuse",
                None,
            );
        }

        // Gate 1: reconnection-storm backoff.
        if let BackoffDecision::Throttled { retry_after_ms } =
            self.admission.check_backoff(identity).await
        {
            let retry_after_secs = retry_after_ms.div_ceil(1000);
            return ConnectOutcome::denied(
                DenyCode::ReconnectionThrottled,
                format!("reconnecting too quickly, wait {retry_after_secs}s"),
                Some(retry_after_secs),
            );
        }

        // Gate 2: system-wide capacity.
        let connection_id = ConnectionId::next();
        match self.admission.admit(connection_id, identity).await {
            Admission::Granted => self.finish_admit(connection_id, identity).await,
            Admission::Queued { position, ticket } => ConnectOutcome::Queued {
                queue_position: position,
                pending: PendingAdmission {
                    connection_id,
                    identity,
                    ticket,
                },
            },
        }
    }

    /// Wait out a queued admission and finish the pipeline if a slot frees.
    pub async fn resolve_queued(self: &Arc<Self>, pending: PendingAdmission) -> ConnectOutcome {
        match pending.ticket.wait().await {
            AdmitOutcome::Admitted => {
                self.finish_admit(pending.connection_id, pending.identity)
                    .await
            }
            AdmitOutcome::TimedOut => ConnectOutcome::denied(
                DenyCode::SystemAtCapacity,
                "system at capacity, try again later",
                None,
            ),
        }
    }

    /// Cancel a queued admission because the client went away before a
    /// slot freed.
    pub async fn abandon_queued(&self, pending: PendingAdmission) {
        self.admission.cancel_wait(pending.ticket.waiter_id()).await;
    }

    /// Gate 3 (per-identity cap) and session registration.
    async fn finish_admit(&self, connection_id: ConnectionId, identity: Identity) -> ConnectOutcome {
        if !self.admission.check_concurrency(identity, connection_id).await {
            // The capacity slot was already claimed; hand it back so the
            // admitted/blocked decision matches the bookkeeping.
            self.admission.release(connection_id).await;
            return ConnectOutcome::denied(
                DenyCode::TooManyConnections,
                "too many simultaneous connections for this address",
                None,
            );
        }

        if let Err(e) = self.liveness.register(connection_id).await {
            debug!(%connection_id, error = %e, "liveness registration skipped");
        }
        self.sessions.lock().await.insert(
            connection_id,
            Session {
                identity,
                connected_at_ms: self.clock.now_ms(),
            },
        );
        info!(%connection_id, identity = %identity, "connection admitted");
        ConnectOutcome::Admitted {
            connection_id,
            identity,
        }
    }

    /// Check one rate-sensitive action for a live connection.
    pub async fn check_action(&self, connection_id: ConnectionId, action: ActionKind) -> ActionDecision {
        let identity = {
            let sessions = self.sessions.lock().await;
            sessions.get(&connection_id).map(|s| s.identity)
        };
        match identity {
            Some(identity) => self.check_action_for(identity, action).await,
            None => ActionDecision::Denied {
                code: DenyCode::InvalidRequest,
                message: format!("no live session for {connection_id}"),
                retry_after_secs: 0,
            },
        }
    }

    /// Check one rate-sensitive action by identity. Used by HTTP-style
    /// callers that have no real-time connection.
    pub async fn check_action_for(&self, identity: Identity, action: ActionKind) -> ActionDecision {
        match self.ratelimiter.check(identity, action).await {
            RateLimitDecision::Allowed {
                limit,
                remaining,
                reset_at_ms,
            } => ActionDecision::Allowed {
                info: RateLimitInfo {
                    limit,
                    remaining,
                    reset_at_ms,
                },
            },
            decision @ RateLimitDecision::Blocked { .. } => {
                let retry_after_secs = decision.retry_after_secs(self.clock.now_ms());
                ActionDecision::Denied {
                    code: DenyCode::for_action(action),
                    message: format!(
                        "{} rate limit exceeded, retry in {retry_after_secs}s",
                        action.as_str()
                    ),
                    retry_after_secs,
                }
            }
        }
    }

    /// Impose a block on an identity without waiting for its counter to
    /// reach the threshold.
    pub async fn record_violation(&self, identity: Identity, action: ActionKind) {
        self.ratelimiter.record_violation(identity, action).await;
    }

    /// Administrative/testing override: clear rate-limit state for a pair.
    pub async fn reset_limits(&self, identity: Identity, action: ActionKind) {
        self.ratelimiter.reset(identity, action).await;
    }

    /// Heartbeat acknowledgment from a client.
    pub async fn pong(&self, connection_id: ConnectionId) {
        if let Err(e) = self.liveness.ack(connection_id).await {
            debug!(%connection_id, error = %e, "heartbeat ack dropped");
        }
    }

    /// Normal departure cleanup: capacity slot, identity slot, liveness
    /// tracking and the session entry.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let session = self.sessions.lock().await.remove(&connection_id);
        let Some(session) = session else {
            return;
        };

        self.admission.release(connection_id).await;
        self.admission
            .release_identity(session.identity, connection_id)
            .await;
        if let Err(e) = self.liveness.deregister(connection_id).await {
            debug!(%connection_id, error = %e, "liveness deregistration skipped");
        }
        let connected_for_ms = self
            .clock
            .now_ms()
            .saturating_sub(session.connected_at_ms);
        debug!(%connection_id, identity = %session.identity, connected_for_ms, "connection closed");
    }

    /// One round of periodic cleanup across every component.
    pub async fn sweep(&self) {
        self.ratelimiter.sweep_expired().await;
        self.admission.sweep().await;
        self.escalation.sweep().await;
    }

    /// Live-state snapshot for telemetry logging.
    pub async fn telemetry(&self) -> GateTelemetry {
        GateTelemetry {
            active_connections: self.admission.active_count().await,
            queue_depth: self.admission.queue_depth().await,
            live_sessions: self.sessions.lock().await.len(),
        }
    }

    /// Stop background tasks and the liveness actor.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
        self.liveness.quit().await;
    }

    async fn handle_termination(&self, connection_id: ConnectionId) {
        warn!(%connection_id, "terminating unresponsive connection");
        self.disconnect(connection_id).await;
        let _ = self
            .event_tx
            .send(OutboundEvent {
                connection_id,
                event: ServerEvent::Error {
                    code: DenyCode::ConnectionTimeout,
                    message: "connection timed out".into(),
                    retry_after_secs: None,
                },
            })
            .await;
    }
}

/// Translates liveness events into outbound channel events, running
/// departure cleanup for terminations.
async fn liveness_pump(gate: Weak<Gatekeeper>, mut rx: mpsc::Receiver<LivenessEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(gate) = gate.upgrade() else {
            return;
        };
        match event {
            LivenessEvent::Ping(connection_id) => {
                let _ = gate
                    .event_tx
                    .send(OutboundEvent {
                        connection_id,
                        event: ServerEvent::Ping,
                    })
                    .await;
            }
            LivenessEvent::Terminate(connection_id) => {
                gate.handle_termination(connection_id).await;
            }
        }
    }
}

/// Periodic cleanup driver.
async fn sweep_loop(gate: Weak<Gatekeeper>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // immediate first tick
    loop {
        interval.tick().await;
        let Some(gate) = gate.upgrade() else {
            return;
        };
        gate.sweep().await;
    }
}
