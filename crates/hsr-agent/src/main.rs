use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hsr_agent::app;
use hsr_agent::config::AgentConfig;
use hsr_agent::identity::FileIdentityStore;
use hsr_agent::logging;
use hsr_agent::service::{self, ForegroundService, ServiceHost};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hsr-agent")]
#[command(about = "HSM signing relay agent - verifies and relays signing requests")]
struct Args {
    /// Configuration file path (environment variables are used otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Pair if needed, then relay messages until interrupted (default)
    Run {
        /// Pairing token used when the device is not paired yet
        #[arg(long)]
        pairing_token: Option<String>,
    },
    /// Pair the device, replacing any stored identity
    Pair {
        #[arg(long)]
        token: String,
    },
    /// Forget the stored identity
    Unpair,
    /// Show the pairing status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AgentConfig::load_from_file(path)?,
        None => AgentConfig::load_from_env()?,
    };

    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let _log_guard = logging::init_logging(
        &level,
        args.log_json || config.log_json,
        config.log_dir.as_deref(),
    )?;

    match args.command.unwrap_or(Command::Run { pairing_token: None }) {
        Command::Run { pairing_token } => run(config, pairing_token).await,
        Command::Pair { token } => {
            let agent = app::build_agent(&config)?;
            let identity = app::repair(&agent, &config, &token).await?;
            println!("paired device {} for user {}", identity.device_id, identity.user_id);
            Ok(())
        }
        Command::Unpair => {
            let agent = app::build_agent(&config)?;
            agent.pairing().unpair().await?;
            println!("identity removed");
            Ok(())
        }
        Command::Status => {
            let store = FileIdentityStore::new(&config.identity_path);
            println!("{}", app::describe_identity(&store).await?);
            Ok(())
        }
    }
}

async fn run(config: AgentConfig, pairing_token: Option<String>) -> anyhow::Result<()> {
    info!(?config, "Starting hsr-agent");

    let agent = Arc::new(app::build_agent(&config)?);
    let prompt = app::pairing_prompt(pairing_token, &config);
    let identity = agent.ensure_paired(prompt.as_ref()).await?;
    info!(user_id = %identity.user_id, device_id = %identity.device_id, "device paired");

    let (mut host, shutdown) = ForegroundService::new();
    host.start().await?;

    let worker = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };
    info!("hsr-agent service started");

    service::shutdown_signal().await?;
    info!("Shutdown signal received");

    host.stop().await?;
    if let Err(e) = worker.await {
        error!(error = %e, "agent loop terminated abnormally");
    }
    info!("hsr-agent stopped");
    Ok(())
}
