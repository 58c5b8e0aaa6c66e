//! LoRaWAN bridge - main entry point

use clap::{Parser, Subcommand};
use lorawan_bridge::api;
use lorawan_bridge::bridge::{BridgeController, BridgeProbe};
use lorawan_bridge::config::BridgeConfig;
use lorawan_bridge::observability::{init_default_logging, metrics, HealthServer};
use lorawan_bridge::pipeline::MessagePipeline;
use lorawan_bridge::transport::mqtt::MqttBroker;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default config locations, tried in order
const DEFAULT_CONFIG_PATHS: &[&str] = &["bridge.toml", "config/bridge.toml"];

/// LoRaWAN gateway to network server MQTT bridge
#[derive(Parser)]
#[command(name = "lorawan-bridge")]
#[command(about = "Forward LoRaWAN gateway events to a network server broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge and the configuration endpoint
    Run {
        /// Override the configuration endpoint port
        #[arg(long, env = "API_PORT")]
        api_port: Option<u16>,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting lorawan-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { api_port } => run_bridge(config, api_port).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(BridgeConfig::default())
}

async fn run_bridge(
    config: BridgeConfig,
    api_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = if config.bridge.structural_topic_rewrite {
        MessagePipeline::structural()
    } else {
        MessagePipeline::literal()
    };
    let broker = MqttBroker::new(config.mqtt.clone());
    let controller = Arc::new(BridgeController::new(
        broker,
        pipeline,
        config.mqtt.channel_capacity,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.health.enabled {
        let port = HealthServer::port_from_env(config.health.port);
        let probe: Arc<dyn BridgeProbe> = controller.clone();
        let health_server = Arc::new(HealthServer::new(port, probe));
        let (_, server) = health_server.serve(shutdown_signal(shutdown_rx.clone()))?;
        tokio::spawn(server);
    }

    let bind: IpAddr = config.api.bind.parse()?;
    let api_addr = SocketAddr::new(bind, api_port.unwrap_or(config.api.port));
    let (_, api_server) = api::serve(
        controller.clone(),
        api_addr,
        shutdown_signal(shutdown_rx.clone()),
    )?;
    let api_handle = tokio::spawn(api_server);

    if let Some(forwarding) = config.forwarding.clone() {
        info!("Applying startup forwarding configuration");
        if let Err(e) = controller.apply_configuration(forwarding).await {
            // The endpoint can still deliver a working configuration
            warn!("Startup configuration not applied: {}", e);
        }
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge running, waiting for configuration on {}", api_addr);

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    controller.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = api_handle.await {
        warn!("Configuration endpoint task ended abnormally: {}", e);
    }

    let snapshot = metrics().get_metrics();
    info!(
        received = snapshot.messages.received,
        forwarded = snapshot.messages.forwarded,
        dropped = snapshot.messages.dropped_total,
        "Final message counters"
    );
    Ok(())
}

async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
