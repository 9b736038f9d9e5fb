//! # Liveness Monitor
//!
//! Heartbeat-based liveness for admitted connections. An actor owns all
//! per-connection state and processes commands sequentially; the public
//! [`LivenessMonitor`] handle is cheap to clone and communicates over an
//! async channel (the same handle/actor split used throughout the crate).
//!
//! ## State machine (per connection)
//!
//! Two states: *healthy* (`missed_pings < 3`) and *terminated*
//! (`missed_pings >= 3`, terminal). Each sweep where a connection has gone
//! a full period without acknowledgment increments the miss counter and
//! probes it; any acknowledgment resets the counter to zero.
//!
//! Terminations are emitted as [`LivenessEvent::Terminate`]; the session
//! orchestrator reacts by running its normal departure cleanup.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::admission::ConnectionId;
use crate::clock::SharedClock;

/// Interval between liveness sweeps, and the grace period a connection has
/// to acknowledge before a miss is counted.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Consecutive missed heartbeats before a connection is terminated.
pub const MAX_MISSED_PINGS: u32 = 3;

/// Outbound effects of the monitor, consumed by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Send a heartbeat probe over this connection.
    Ping(ConnectionId),
    /// This connection missed too many heartbeats; terminate it.
    Terminate(ConnectionId),
}

#[derive(Clone, Copy, Debug)]
struct LivenessState {
    last_ping_at_ms: u64,
    missed_pings: u32,
}

enum Command {
    Register(ConnectionId),
    Ack(ConnectionId),
    Deregister(ConnectionId),
    /// Run one sweep now and acknowledge completion. Used by tests and by
    /// callers that drive time manually.
    Sweep(oneshot::Sender<()>),
    Tracked(oneshot::Sender<usize>),
    Quit,
}

/// Handle to the liveness actor.
#[derive(Clone)]
pub struct LivenessMonitor {
    cmd_tx: mpsc::Sender<Command>,
}

impl LivenessMonitor {
    /// Spawn the monitor actor. Returns the handle and the receiver for
    /// outbound [`LivenessEvent`]s.
    pub fn spawn(
        period: Duration,
        clock: SharedClock,
    ) -> (Self, mpsc::Receiver<LivenessEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        let actor = LivenessActor {
            period,
            clock,
            connections: HashMap::new(),
            event_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx }, event_rx)
    }

    /// Start tracking an admitted connection. Counts as an implicit
    /// acknowledgment at registration time.
    pub async fn register(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(Command::Register(connection_id)).await
    }

    /// Record a heartbeat acknowledgment: resets the miss counter.
    pub async fn ack(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(Command::Ack(connection_id)).await
    }

    /// Stop tracking a departed connection.
    pub async fn deregister(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(Command::Deregister(connection_id)).await
    }

    /// Run one sweep immediately and wait for it to finish.
    pub async fn force_sweep(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Sweep(tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("liveness actor closed"))
    }

    /// Number of currently tracked connections.
    pub async fn tracked(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Tracked(tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("liveness actor closed"))
    }

    /// Shut the actor down.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("liveness actor closed"))
    }
}

struct LivenessActor {
    period: Duration,
    clock: SharedClock,
    connections: HashMap<ConnectionId, LivenessState>,
    event_tx: mpsc::Sender<LivenessEvent>,
}

impl LivenessActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut sweep_interval = tokio::time::interval(self.period);
        // The first tick fires immediately; skip it so freshly registered
        // connections get a full period before their first probe.
        sweep_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Register(id)) => {
                            self.connections.insert(id, LivenessState {
                                last_ping_at_ms: self.clock.now_ms(),
                                missed_pings: 0,
                            });
                        }
                        Some(Command::Ack(id)) => {
                            if let Some(state) = self.connections.get_mut(&id) {
                                state.last_ping_at_ms = self.clock.now_ms();
                                state.missed_pings = 0;
                            }
                        }
                        Some(Command::Deregister(id)) => {
                            self.connections.remove(&id);
                        }
                        Some(Command::Sweep(reply)) => {
                            self.sweep().await;
                            let _ = reply.send(());
                        }
                        Some(Command::Tracked(reply)) => {
                            let _ = reply.send(self.connections.len());
                        }
                        Some(Command::Quit) => {
                            debug!("liveness actor quitting");
                            break;
                        }
                        None => {
                            debug!("liveness handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = sweep_interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One liveness round over every tracked connection.
    async fn sweep(&mut self) {
        let now = self.clock.now_ms();
        let period_ms = self.period.as_millis() as u64;

        // Snapshot ids: terminations mutate the map mid-iteration.
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(state) = self.connections.get_mut(&id) else {
                continue;
            };
            if now.saturating_sub(state.last_ping_at_ms) < period_ms {
                continue;
            }
            state.missed_pings += 1;

            if state.missed_pings >= MAX_MISSED_PINGS {
                self.connections.remove(&id);
                warn!(connection_id = %id, "connection missed {MAX_MISSED_PINGS} heartbeats, terminating");
                let _ = self.event_tx.send(LivenessEvent::Terminate(id)).await;
            } else {
                debug!(connection_id = %id, missed = state.missed_pings, "heartbeat probe");
                let _ = self.event_tx.send(LivenessEvent::Ping(id)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const PERIOD: Duration = Duration::from_secs(300);

    fn monitor() -> (LivenessMonitor, mpsc::Receiver<LivenessEvent>, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let (monitor, events) = LivenessMonitor::spawn(PERIOD, Arc::new(clock.clone()));
        (monitor, events, clock)
    }

    #[tokio::test]
    async fn responsive_connection_is_never_terminated() {
        let (monitor, mut events, clock) = monitor();
        let id = ConnectionId::next();
        monitor.register(id).await.unwrap();

        for _ in 0..10 {
            clock.advance(PERIOD);
            monitor.force_sweep().await.unwrap();
            assert_eq!(events.recv().await, Some(LivenessEvent::Ping(id)));
            monitor.ack(id).await.unwrap();
        }
        assert_eq!(monitor.tracked().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn three_misses_terminate() {
        let (monitor, mut events, clock) = monitor();
        let id = ConnectionId::next();
        monitor.register(id).await.unwrap();

        clock.advance(PERIOD);
        monitor.force_sweep().await.unwrap();
        assert_eq!(events.recv().await, Some(LivenessEvent::Ping(id)));

        clock.advance(PERIOD);
        monitor.force_sweep().await.unwrap();
        assert_eq!(events.recv().await, Some(LivenessEvent::Ping(id)));

        clock.advance(PERIOD);
        monitor.force_sweep().await.unwrap();
        assert_eq!(events.recv().await, Some(LivenessEvent::Terminate(id)));
        assert_eq!(monitor.tracked().await.unwrap(), 0);

        // Terminated is terminal: further sweeps emit nothing.
        clock.advance(PERIOD);
        monitor.force_sweep().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_ack_resets_miss_counter() {
        let (monitor, mut events, clock) = monitor();
        let id = ConnectionId::next();
        monitor.register(id).await.unwrap();

        // Two misses...
        for _ in 0..2 {
            clock.advance(PERIOD);
            monitor.force_sweep().await.unwrap();
            assert_eq!(events.recv().await, Some(LivenessEvent::Ping(id)));
        }
        // ...then one ack resets to zero.
        monitor.ack(id).await.unwrap();

        // Two more misses still do not terminate.
        for _ in 0..2 {
            clock.advance(PERIOD);
            monitor.force_sweep().await.unwrap();
            assert_eq!(events.recv().await, Some(LivenessEvent::Ping(id)));
        }
        assert_eq!(monitor.tracked().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fresh_connection_is_not_probed_early() {
        let (monitor, mut events, clock) = monitor();
        let id = ConnectionId::next();
        monitor.register(id).await.unwrap();

        clock.advance(PERIOD - Duration::from_secs(1));
        monitor.force_sweep().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregistered_connection_is_forgotten() {
        let (monitor, mut events, clock) = monitor();
        let id = ConnectionId::next();
        monitor.register(id).await.unwrap();
        monitor.deregister(id).await.unwrap();

        clock.advance(PERIOD * 4);
        monitor.force_sweep().await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(monitor.tracked().await.unwrap(), 0);
    }
}
