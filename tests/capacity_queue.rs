//! Capacity-gate behavior through the public API: queueing at the cap,
//! FIFO drain on disconnect, queue timeout and abandoned waiters.

use std::sync::Arc;
use std::time::Duration;

use roomgate::{
    AdmissionConfig, ConnectOutcome, ConnectionId, DenyCode, GateConfig, Gatekeeper, ManualClock,
    MemoryStore, OutboundEvent, PendingAdmission,
};
use tokio::sync::mpsc;

fn small_config() -> GateConfig {
    GateConfig {
        admission: AdmissionConfig {
            max_concurrent: 2,
            ..AdmissionConfig::default()
        },
        ..GateConfig::default()
    }
}

fn spawn_gate() -> (Arc<Gatekeeper>, mpsc::Receiver<OutboundEvent>) {
    let clock = ManualClock::new(1_000_000);
    let store = Arc::new(MemoryStore::new());
    Gatekeeper::spawn(small_config(), store, Arc::new(clock))
}

async fn admit(gate: &Arc<Gatekeeper>, addr: &str) -> ConnectionId {
    match gate.connect(addr).await {
        ConnectOutcome::Admitted { connection_id, .. } => connection_id,
        _ => panic!("expected {addr} to be admitted"),
    }
}

async fn queued(gate: &Arc<Gatekeeper>, addr: &str) -> (usize, PendingAdmission) {
    match gate.connect(addr).await {
        ConnectOutcome::Queued { queue_position, pending } => (queue_position, pending),
        _ => panic!("expected {addr} to be queued"),
    }
}

#[tokio::test]
async fn connection_at_capacity_is_queued() {
    let (gate, _events) = spawn_gate();

    admit(&gate, "198.51.100.1:40000").await;
    admit(&gate, "198.51.100.2:40000").await;

    let (position, _pending) = queued(&gate, "198.51.100.3:40000").await;
    assert_eq!(position, 1);

    let telemetry = gate.telemetry().await;
    assert_eq!(telemetry.active_connections, 2);
    assert_eq!(telemetry.queue_depth, 1);
}

#[tokio::test]
async fn disconnect_promotes_the_queued_connection() {
    let (gate, _events) = spawn_gate();

    let first = admit(&gate, "198.51.100.1:40000").await;
    admit(&gate, "198.51.100.2:40000").await;
    let (_, pending) = queued(&gate, "198.51.100.3:40000").await;

    gate.disconnect(first).await;
    match gate.resolve_queued(pending).await {
        ConnectOutcome::Admitted { .. } => {}
        _ => panic!("freed slot should admit the queued connection"),
    }

    let telemetry = gate.telemetry().await;
    assert_eq!(telemetry.active_connections, 2);
    assert_eq!(telemetry.queue_depth, 0);
    assert_eq!(telemetry.live_sessions, 2);
}

#[tokio::test(start_paused = true)]
async fn queue_wait_lapses_into_a_capacity_denial() {
    let (gate, _events) = spawn_gate();

    admit(&gate, "198.51.100.1:40000").await;
    admit(&gate, "198.51.100.2:40000").await;
    let (_, pending) = queued(&gate, "198.51.100.3:40000").await;

    // No slot frees within the queue timeout.
    tokio::time::advance(Duration::from_secs(31)).await;
    match gate.resolve_queued(pending).await {
        ConnectOutcome::Denied { code, .. } => assert_eq!(code, DenyCode::SystemAtCapacity),
        _ => panic!("lapsed queue wait must deny"),
    }

    let telemetry = gate.telemetry().await;
    assert_eq!(telemetry.active_connections, 2);
    assert_eq!(telemetry.queue_depth, 0);
}

#[tokio::test]
async fn abandoned_waiter_does_not_hold_a_slot() {
    let (gate, _events) = spawn_gate();

    let first = admit(&gate, "198.51.100.1:40000").await;
    admit(&gate, "198.51.100.2:40000").await;
    let (_, abandoned) = queued(&gate, "198.51.100.3:40000").await;
    let (_, kept) = queued(&gate, "198.51.100.4:40000").await;

    // The client behind the first waiter went away before a slot freed.
    gate.abandon_queued(abandoned).await;

    gate.disconnect(first).await;
    match gate.resolve_queued(kept).await {
        ConnectOutcome::Admitted { .. } => {}
        _ => panic!("the remaining waiter should take the freed slot"),
    }
    assert_eq!(gate.telemetry().await.active_connections, 2);
}

#[tokio::test]
async fn drained_waiter_still_faces_the_identity_gate() {
    let clock = ManualClock::new(1_000_000);
    let store = Arc::new(MemoryStore::new());
    let mut config = small_config();
    config.admission.max_concurrent = 3;
    let (gate, _events) = Gatekeeper::spawn(config, store, Arc::new(clock));

    // Identity .1 holds both its slots; .2 fills the system.
    admit(&gate, "198.51.100.1:40000").await;
    admit(&gate, "198.51.100.1:40001").await;
    let other = admit(&gate, "198.51.100.2:40000").await;

    // A third connection from .1 queues at the capacity gate.
    let (_, pending) = queued(&gate, "198.51.100.1:40002").await;

    // The freed slot drains the waiter, but .1 is still at its own cap:
    // the next gate denies and the capacity slot is handed back.
    gate.disconnect(other).await;
    match gate.resolve_queued(pending).await {
        ConnectOutcome::Denied { code, .. } => assert_eq!(code, DenyCode::TooManyConnections),
        _ => panic!("identity cap must still apply after the queue"),
    }
    assert_eq!(gate.telemetry().await.active_connections, 2);
}
