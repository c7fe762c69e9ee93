//! Agentainer control-plane entry point: wires configuration, the Redis
//! state store, the Docker runtime, the agent manager, the health
//! monitor, and the logger together, then runs until signalled to stop.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agentainer::agent::AgentManager;
use agentainer::config::Configuration;
use agentainer::events::EventBus;
use agentainer::health::HealthMonitor;
use agentainer::logger::{self, Logger};
use agentainer::runtime::docker::DockerRuntime;
use agentainer::store::Store;

#[derive(Parser)]
#[command(name = "agentainer")]
#[command(about = "Control plane for containerized agent workloads")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "agentainer.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Configuration::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("warning: {e:#}, falling back to defaults");
        Configuration::default()
    });
    if cli.debug {
        config.debug = true;
    }
    let config = Arc::new(config);

    let log_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agentainer={log_level}").into()),
        )
        .init();

    info!("starting agentainer v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("fatal error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Arc<Configuration>) -> Result<()> {
    let store = Store::connect(&config.redis.addr, config.redis.db).await?;

    let logger = Logger::open(
        &config.logging.log_dir,
        store.clone(),
        config.logging.console_logging_enabled,
    )?;
    logger::init(logger);

    let runtime = DockerRuntime::connect()?;
    let events = EventBus::new();

    let manager = Arc::new(AgentManager::new(
        store.clone(),
        Arc::new(runtime),
        events,
        config.clone(),
    ));
    let health_monitor = HealthMonitor::new(manager.clone(), store, config.clone());

    let cancel = CancellationToken::new();

    let rotation_task = tokio::spawn(logger::spawn_rotation_task(cancel.child_token()));
    let health_task = {
        let cancel = cancel.child_token();
        tokio::spawn(async move { health_monitor.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), health_task).await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), rotation_task).await;

    info!("shutdown complete");
    Ok(())
}
