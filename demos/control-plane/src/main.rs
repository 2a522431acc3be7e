//! Minimal control plane: accept agent connections, log their traffic, and
//! offer a tiny REPL-free dispatch of a demo command to each new session.
//!
//! Run with: cargo run -p control-plane-demo -- --token dev-secret
//!
//! Then connect an agent:
//!   remote-ops login --token dev-secret
//!   remote-ops connect --endpoint ws://127.0.0.1:8400/ws --reconnect

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use remote_ops_broker::{
    Broker, BrokerEvent, LivenessConfig, LivenessMonitor, StaticTokenVerifier, WsState, websocket,
};
use remote_ops_protocol::{Command, tool};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "control-plane-demo", about = "Run a demo control plane")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8400")]
    listen: SocketAddr,

    /// Shared bearer token accepted from agents.
    #[arg(long, env = "REMOTE_OPS_TOKEN")]
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let broker = Arc::new(Broker::new());
    let monitor = LivenessMonitor::new(Arc::clone(broker.registry()), LivenessConfig::default());
    let monitor_handle = monitor.spawn();

    // Log all broker traffic and greet each new session with a probe command.
    let events_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        let mut events = events_broker.events().subscribe();
        while let Ok(event) = events.recv().await {
            match event {
                BrokerEvent::Connected { session } => {
                    tracing::info!(
                        session_id = %session.session_id,
                        machine_id = %session.machine_id,
                        "Agent connected"
                    );
                    let broker = Arc::clone(&events_broker);
                    tokio::spawn(async move {
                        let mut parameters = serde_json::Map::new();
                        parameters.insert("command".to_string(), "uname -a".into());
                        let command = Command::new(
                            Uuid::new_v4().to_string(),
                            tool::RUN_COMMAND,
                            parameters,
                        );
                        match broker
                            .dispatcher()
                            .dispatch(&session.session_id, command, None)
                            .await
                        {
                            Ok(result) => tracing::info!(?result, "Probe command finished"),
                            Err(err) => tracing::warn!("Probe command failed: {err}"),
                        }
                    });
                }
                BrokerEvent::Disconnected { session, reason } => {
                    tracing::info!(
                        session_id = %session.session_id,
                        reason,
                        "Agent disconnected"
                    );
                }
                BrokerEvent::ExecutionOutput { session_id, output } => {
                    tracing::info!(
                        session_id,
                        command_id = %output.command_id,
                        stream = ?output.stream,
                        data = %output.data.trim_end(),
                        "Output"
                    );
                }
                BrokerEvent::CommandResult { session_id, result } => {
                    tracing::info!(
                        session_id,
                        command_id = %result.command_id,
                        success = result.is_success(),
                        "Result"
                    );
                }
            }
        }
    });

    let state = WsState {
        broker,
        verifier: Arc::new(StaticTokenVerifier::new(args.token, "demo-user")),
    };
    let app = websocket::router(state);

    tracing::info!("Control plane listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    axum::serve(listener, app).await.context("server error")?;

    monitor_handle.abort();
    Ok(())
}
