use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use shadowsocks_hub::config::HubConfig;
use shadowsocks_hub::coordinator::Coordinator;
use shadowsocks_hub::db::Database;
use shadowsocks_hub::node_sync::HttpNodeSync;
use shadowsocks_hub::version::{CORE_VERSION, VERSION};
use shadowsocks_hub::writer::ConfigSynthesizer;
use shadowsocks_hub::xray::{ProcessSupervisor, XraySupervisor};

#[derive(Parser, Debug)]
#[command(name = "hub", version = VERSION, about = "Shadowsocks relay hub")]
struct Args {
    /// Path to a TOML config file. Environment variables (HUB_*) override it.
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(config: &HubConfig) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(&config.log_dir, "hub.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match HubConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Critical error loading configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config);
    info!(version = VERSION, core = CORE_VERSION, "Starting hub...");

    let database = match Database::open(config.database_path()).await {
        Ok(database) => {
            info!(path = ?database.path(), "Database ready.");
            Arc::new(database)
        }
        Err(e) => {
            error!(error = %e, "Cannot open the database. Exiting.");
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let supervisor = Arc::new(XraySupervisor::new(
        &config.xray_binary_path,
        config.xray_config_path(),
        &config.xray_log_level,
        config.engine_connect_deadline(),
        shutdown.clone(),
    ));

    let node_sync = Arc::new(HttpNodeSync::new(config.http_timeout())?);
    let coordinator = Coordinator::new(
        database,
        ConfigSynthesizer::new(config.xray_log_level.clone()),
        supervisor.clone(),
        node_sync,
        config.stats_interval(),
        shutdown.clone(),
    );

    if let Err(e) = coordinator.run().await {
        error!(error = %e, "Initial sync failed. Exiting.");
        supervisor.shutdown().await;
        return Err(e.into());
    }
    info!(engine = ?supervisor.phase().await, "Hub is running.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Cannot listen for the shutdown signal.");
            }
            info!("Shutdown signal received.");
        }
        _ = shutdown.cancelled() => {
            error!("Coordinator stopped after a fatal error.");
        }
    }

    shutdown.cancel();
    supervisor.shutdown().await;
    info!("Hub stopped.");
    Ok(())
}
