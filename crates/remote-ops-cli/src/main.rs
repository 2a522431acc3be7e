//! `remote-ops` - connect a local machine to the control plane.

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::{Parser, Subcommand};
use remote_ops_agent::{AgentConfig, AgentOptions, ReconnectPolicy, run};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "remote-ops",
    about = "Connect a machine to the remote-ops control plane",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Store a pre-issued access token.
    Login {
        /// Bearer credential issued by the control plane.
        #[arg(long)]
        token: String,
    },
    /// Open the persistent connection and execute dispatched commands.
    Connect {
        /// WebSocket endpoint (overrides stored config and environment).
        #[arg(long, env = "REMOTE_OPS_ENDPOINT")]
        endpoint: Option<String>,
        /// Project directory to operate in.
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Custom machine identifier.
        #[arg(long)]
        machine_id: Option<String>,
        /// Automatically reconnect on unexpected disconnects.
        #[arg(long)]
        reconnect: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run_cli(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let config_path = AgentConfig::default_path()?;
    let mut config = AgentConfig::load_from(&config_path)?;

    match cli.command {
        CliCommand::Login { token } => {
            config.merge(AgentConfig {
                access_token: Some(token),
                ..AgentConfig::default()
            });
            config.save_to(&config_path)?;
            tracing::info!("Credential stored in {}", config_path.display());
            Ok(())
        }
        CliCommand::Connect {
            endpoint,
            project_dir,
            machine_id,
            reconnect,
        } => {
            let access_token = config.access_token.clone().context(
                "no stored credential; run `remote-ops login --token <TOKEN>` first",
            )?;
            let resolved_endpoint = endpoint
                .clone()
                .or_else(|| config.endpoint.clone())
                .context("no endpoint configured; pass --endpoint or set REMOTE_OPS_ENDPOINT")?;
            let resolved_project =
                resolve_project_dir(project_dir.clone().or_else(|| config.project_directory.clone()))?;
            let resolved_machine = machine_id
                .clone()
                .or_else(|| config.machine_id.clone())
                .unwrap_or_else(default_machine_id);

            // Remember explicitly passed flags for the next invocation.
            if endpoint.is_some() || project_dir.is_some() || machine_id.is_some() {
                config.merge(AgentConfig {
                    endpoint,
                    project_directory: project_dir.map(|_| resolved_project.clone()),
                    machine_id,
                    access_token: None,
                });
                config.save_to(&config_path)?;
            }

            let options = AgentOptions {
                endpoint: resolved_endpoint,
                access_token,
                machine_id: resolved_machine,
                session_id: Uuid::new_v4().to_string(),
                project_directory: resolved_project,
            };
            let policy = ReconnectPolicy {
                enabled: reconnect,
                ..ReconnectPolicy::default()
            };

            tracing::info!(
                endpoint = %options.endpoint,
                project_directory = %options.project_directory.display(),
                machine_id = %options.machine_id,
                "Connecting to control plane"
            );

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    signal_token.cancel();
                }
            });

            run(&options, &policy, &shutdown).await?;
            Ok(())
        }
    }
}

fn resolve_project_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match dir {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => std::env::current_dir()?.join(dir),
        None => std::env::current_dir()?,
    };
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create project directory {}", dir.display()))?;
    }
    Ok(dir)
}

fn default_machine_id() -> String {
    let user = dirs::home_dir()
        .and_then(|home| home.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "user".to_string());
    format!("{}-{}-{user}", std::env::consts::OS, std::env::consts::ARCH)
}
