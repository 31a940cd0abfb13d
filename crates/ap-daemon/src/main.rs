//! autopilotd: runs the queue processor, resource sweeper and health
//! monitor until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ap_agents::{AgentRuntime, DelegationLoop, MissionLoopEngine, TimerFollowupDispatcher};
use ap_core::config::Config;
use ap_core::mission::MissionLimits;
use ap_core::queue::RunQueue;
use ap_core::session_store::SessionStore;
use ap_core::storage::JsonFileStorage;
use ap_daemon::alerts::{AlertRoute, LogOnlyConnector};
use ap_daemon::daemon::{DaemonIntervals, DaemonSupervisor};
use ap_daemon::heartbeat::{HealthMonitor, StalenessPolicy};
use ap_daemon::queue::QueueProcessor;
use ap_daemon::sweeper::{InMemoryResourcePool, ResourceSweeper};
use ap_intelligence::{InMemoryMemory, LlmConfig, OpenAiCompatibleProvider};
use ap_telemetry::logging::{init_logging, LogFormat};
use clap::Parser;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// autopilot daemon -- keeps persistent sessions moving toward their goals.
#[derive(Parser)]
#[command(name = "autopilotd", version, about)]
struct Cli {
    /// Config file (default: ~/.autopilot/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit one JSON object per log line.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        config.general.log_format.parse().unwrap_or_default()
    };
    init_logging("autopilotd", &config.general.log_level, format);
    info!(version = env!("CARGO_PKG_VERSION"), "autopilot daemon starting");

    let supervisor = build_supervisor(&config)?;
    supervisor.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");

    supervisor.stop().await;
    info!("autopilot daemon stopped");
    Ok(())
}

fn build_supervisor(config: &Config) -> Result<DaemonSupervisor> {
    let data_dir = config.general.expanded_data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    info!(data_dir = %data_dir.display(), "using JSON file storage");

    let storage = Arc::new(JsonFileStorage::new(&data_dir));
    let sessions = Arc::new(SessionStore::new(
        storage,
        MissionLimits::from(&config.mission),
    ));

    let provider = Arc::new(OpenAiCompatibleProvider::from_config(&config.llm));
    let llm = LlmConfig::from(&config.llm);
    info!(base_url = %provider.base_url(), model = %llm.model, "model provider configured");

    let queue = Arc::new(RunQueue::new());
    let delegation = Arc::new(DelegationLoop::new(
        sessions.clone(),
        provider.clone(),
        Arc::new(InMemoryMemory::new()),
        llm.clone(),
        config.delegation.clone(),
    ));
    let mission = Arc::new(MissionLoopEngine::new(
        sessions.clone(),
        provider,
        llm,
        config.mission.clone(),
    ));
    let followups = Arc::new(TimerFollowupDispatcher::new(queue.clone()));
    let runtime = Arc::new(AgentRuntime::new(
        sessions.clone(),
        delegation,
        mission,
        followups.clone(),
    ));

    let alerts = match (&config.alerts.connector, &config.alerts.channel) {
        (Some(connector), Some(channel)) => {
            warn!(
                connector = %connector,
                channel = %channel,
                "no delivery connector is linked into this build, alerts are logged"
            );
            AlertRoute::new(Box::new(LogOnlyConnector), channel.clone())
        }
        _ => AlertRoute::log_only(),
    };

    let processor = Arc::new(QueueProcessor::new(queue, runtime));
    let sweeper = Arc::new(ResourceSweeper::new(
        Arc::new(InMemoryResourcePool::new()),
        config.daemon.sweeper_max_idle(),
    ));
    let health = Arc::new(HealthMonitor::new(
        sessions,
        alerts,
        StalenessPolicy::from(&config.daemon),
    ));

    Ok(DaemonSupervisor::new(
        DaemonIntervals::from(&config.daemon),
        processor,
        sweeper,
        health,
    )
    .with_followups(followups))
}
