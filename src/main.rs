//! WolfTunnel - Encrypted Tunnel Endpoint
//!
//! Command-line entry point: loads the configuration, creates the TUN
//! device and collaborators, and runs the tunnel session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolftunnel::config::TunnelConfig;
use wolftunnel::device::{self, TunDevice};
use wolftunnel::error::{Error, Result};
use wolftunnel::session::{self, SessionInput, SessionLinks, SessionSettings, TunnelSession};
use wolftunnel::{codec, dns, proxy};

/// WolfTunnel - Encrypted Tunnel Endpoint
#[derive(Parser)]
#[command(name = "wolftunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolftunnel.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel endpoint
    Run,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolftunnel.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => run(cli.config, cli.log_level).await,
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact");
            run_init(output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact");
            run_validate(cli.config)
        }
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Time allowed for the traffic pump to wind down after the session ends
const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the tunnel endpoint until Ctrl-C or a fatal error
async fn run(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match TunnelConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            init_logging(log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Starting WolfTunnel {}", env!("CARGO_PKG_VERSION"));

    let peer = config.server_addr()?;
    let settings = SessionSettings::from_config(&config)?;
    let codec = codec::from_config(&config.codec)?;
    let variant = session::variant::from_config(&config);

    let tun = Arc::new(TunDevice::create(&config.device.name)?);
    tun.configure(&config.device)?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(peer)
        .await
        .map_err(|e| Error::Transport(format!("cannot reach {}: {}", peer, e)))?;
    tracing::info!("Tunnel socket {} -> {}", socket.local_addr()?, peer);

    let (links, endpoints) = SessionLinks::channel();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

    let pump = tokio::spawn(device::run_traffic_pump(
        tun.clone(),
        endpoints.traffic,
        inbox_tx.clone(),
    ));
    tokio::spawn(dns::run_passthrough(endpoints.dns, links.traffic.clone()));
    tokio::spawn(proxy::run_udp_proxy(
        endpoints.proxy,
        inbox_tx.clone(),
        proxy::DEFAULT_IDLE_TIMEOUT,
    ));

    {
        let inbox = inbox_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
                let _ = inbox.send(SessionInput::Shutdown);
            }
        });
    }

    let session = TunnelSession::new(settings, variant, codec, links, peer, Instant::now())?;
    let result = session::driver::run(session, socket, inbox_rx).await;

    // The session held the last traffic sender, so the pump stops its capture thread and exits
    match tokio::time::timeout(PUMP_STOP_TIMEOUT, pump).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("Traffic pump failed: {}", e),
        Ok(Err(e)) => tracing::warn!("Traffic pump task failed: {}", e),
        Err(_) => tracing::warn!("Traffic pump did not stop within {:?}", PUMP_STOP_TIMEOUT),
    }

    match result {
        Ok(stats) => {
            tracing::info!("Tunnel stopped: {:?}", stats);
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            tracing::error!("Fatal tunnel error: {}", e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("Tunnel session failed: {}", e);
            Err(e)
        }
    }
}

/// Write a starter configuration file
fn run_init(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{:?} already exists", output)));
    }
    TunnelConfig::example().save(&output)?;
    println!("✓ Configuration written to {:?}", output);
    println!("  Edit tunnel.server_address, credentials and codec.key before running");
    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match TunnelConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server:         {}", config.tunnel.server_address);
            println!("  Variant:        {:?}", config.tunnel.variant);
            println!("  Codec:          {}", config.codec.name);
            println!("  UDP global:     {}", config.udp.global);
            println!("  Whitelist:      {} rules", config.udp.whitelist.len());
            println!("  Device:         {} ({}/{})", config.device.name, config.device.address, config.device.prefix);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
