use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use roomgate::{
    ActionDecision, ActionKind, ConnectOutcome, GateConfig, Gatekeeper, MemoryStore, ServerEvent,
    SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "roomgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of synthetic client addresses to drive traffic from.
    #[arg(short, long, default_value = "8")]
    clients: u16,

    /// Seconds between synthetic traffic rounds.
    #[arg(short = 'r', long, default_value = "5")]
    round_interval: u64,

    #[arg(short, long, default_value = "60")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let store = Arc::new(MemoryStore::new());
    let (gate, mut events) = Gatekeeper::spawn(GateConfig::default(), store, Arc::new(SystemClock));
    info!(clients = args.clients, "roomgate demo starting");

    // Answer heartbeat probes on behalf of the synthetic clients.
    let pong_gate = gate.clone();
    tokio::spawn(async move {
        while let Some(outbound) = events.recv().await {
            match outbound.event {
                ServerEvent::Ping => pong_gate.pong(outbound.connection_id).await,
                ServerEvent::Error { code, message, .. } => {
                    warn!(connection_id = %outbound.connection_id, %code, reason = message, "channel notice");
                }
                ServerEvent::Queued { queue_position, .. } => {
                    info!(connection_id = %outbound.connection_id, queue_position, "queued");
                }
            }
        }
    });

    // Connect the synthetic clients up front.
    let mut connections = Vec::new();
    for n in 0..args.clients {
        let addr = format!("198.51.100.{}:40000", n % 250);
        match gate.connect(&addr).await {
            ConnectOutcome::Admitted { connection_id, identity } => {
                info!(%connection_id, %identity, "admitted");
                connections.push(connection_id);
            }
            ConnectOutcome::Queued { queue_position, pending } => {
                info!(queue_position, "waiting for a capacity slot");
                if let ConnectOutcome::Admitted { connection_id, .. } =
                    gate.resolve_queued(pending).await
                {
                    connections.push(connection_id);
                }
            }
            ConnectOutcome::Denied { code, message, .. } => {
                warn!(%code, reason = message, "connection denied");
            }
        }
    }

    let mut traffic = time::interval(Duration::from_secs(args.round_interval));
    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval));
    let mut round: u64 = 0;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = traffic.tick() => {
                round += 1;
                for &connection_id in &connections {
                    let action = match round % 3 {
                        0 => ActionKind::Join,
                        1 => ActionKind::Chat,
                        _ => ActionKind::Api,
                    };
                    match gate.check_action(connection_id, action).await {
                        ActionDecision::Allowed { info } => {
                            info!(%connection_id, action = action.as_str(), remaining = info.remaining, "allowed");
                        }
                        ActionDecision::Denied { code, retry_after_secs, .. } => {
                            warn!(%connection_id, %code, retry_after_secs, "denied");
                        }
                    }
                }
            }
            _ = telemetry.tick() => {
                let snapshot = gate.telemetry().await;
                info!(
                    active_connections = snapshot.active_connections,
                    queue_depth = snapshot.queue_depth,
                    live_sessions = snapshot.live_sessions,
                    "telemetry snapshot"
                );
            }
        }
    }

    for connection_id in connections {
        gate.disconnect(connection_id).await;
    }
    gate.shutdown().await;

    Ok(())
}
