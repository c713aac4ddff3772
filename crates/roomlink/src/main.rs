//! # roomlink
//!
//! Bridge binary: loads settings, opens the in-process broker, declares the exchanges,
//! starts the monitor and serves WebSocket clients until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use roomlink_broker::{ConnectOptions, MemoryBroker};
use roomlink_server::{bootstrap, RoomlinkServer, ServerConfig};
use roomlink_settings::{BrokerSettings, RoomlinkSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Room-based WebSocket to topic broker bridge.
#[derive(Parser, Debug)]
#[command(name = "roomlink", about = "Room-based WebSocket to topic broker bridge")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.roomlink/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or `RUST_LOG`-style filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, settings: &mut RoomlinkSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<RoomlinkSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(roomlink_settings::settings_path);
    let mut settings = roomlink_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

/// Open the in-process broker. `host` is carried in the connect options for
/// identification only; nothing is dialled.
fn connect_broker(settings: &BrokerSettings) -> Arc<MemoryBroker> {
    info!(
        broker_host = %settings.host,
        application = %settings.application_name,
        "using in-process broker, broker.host is not dialled"
    );
    MemoryBroker::connect(ConnectOptions {
        host: settings.host.clone(),
        application_name: settings.application_name.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    if settings.logging.json {
        roomlink_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        roomlink_core::logging::init_subscriber(&settings.logging.level);
    }

    let broker = connect_broker(&settings.broker);

    let fatal = CancellationToken::new();
    let bridge = bootstrap(broker, fatal.clone())
        .await
        .context("Failed to start the bridge")?;
    let server = Arc::new(RoomlinkServer::new(
        ServerConfig::from(&settings.server),
        bridge,
    ));
    let (addr, handle) = server
        .clone()
        .spawn()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().bind_addr()))?;
    info!("roomlink listening on ws://{addr}/<room>");

    let lost = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("shutdown requested");
            false
        }
        () = fatal.cancelled() => {
            error!("broker connection lost, shutting down");
            true
        }
    };

    server.shutdown().shutdown();
    handle
        .await
        .context("Server task panicked")?
        .context("Server error")?;
    info!("roomlink stopped");

    if lost {
        anyhow::bail!("broker connection lost");
    }
    Ok(())
}
