//! Bootloader bridge binary entrypoint.
//!
//! Serves two listeners:
//! - the HTTP API (`/bl/*`, `/events`) for operators and front-ends;
//! - the device WebSocket, where the bootloader dials in.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bl_bridge::{Bridge, BridgeConfig, spawn_hub};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bl-bridge",
    about = "HTTP bridge to a WebSocket-connected bootloader device",
    version
)]
struct Opts {
    /// TOML config file; missing keys take defaults
    #[arg(long, env = "BL_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for the HTTP API (e.g., 127.0.0.1:3000)
    #[arg(long, env = "BL_BRIDGE_HTTP_BIND")]
    http_bind: Option<String>,

    /// Bind address for the device WebSocket (e.g., 0.0.0.0:8080)
    #[arg(long, env = "BL_BRIDGE_DEVICE_BIND")]
    device_bind: Option<String>,

    /// Upper bound on one HTTP command call, in seconds
    #[arg(long, env = "BL_BRIDGE_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,
}

impl Opts {
    fn load_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };
        if let Some(bind) = &self.http_bind {
            config = config.with_http_bind(bind.clone());
        }
        if let Some(bind) = &self.device_bind {
            config = config.with_device_bind(bind.clone());
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let opts = Opts::parse();
    let config = opts.load_config()?;

    let (hub, _hub_task) = spawn_hub(config.subscriber_buffer);
    let bridge = Bridge::new(&config, hub);

    let http = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("binding HTTP API on {}", config.http_bind))?;
    let device = TcpListener::bind(&config.device_bind)
        .await
        .with_context(|| format!("binding device listener on {}", config.device_bind))?;
    info!(http = %config.http_bind, device = %config.device_bind, "bl-bridge listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(?e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let api = bridge.api_router();
    let devices = bridge
        .device_router()
        .into_make_service_with_connect_info::<SocketAddr>();

    let mut http_shutdown = shutdown_rx.clone();
    let mut device_shutdown = shutdown_rx;
    tokio::try_join!(
        async {
            axum::serve(http, api)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.wait_for(|stop| *stop).await;
                })
                .await
                .context("HTTP API server")
        },
        async {
            axum::serve(device, devices)
                .with_graceful_shutdown(async move {
                    let _ = device_shutdown.wait_for(|stop| *stop).await;
                })
                .await
                .context("device listener")
        },
    )?;

    info!("bl-bridge stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    // Default to info but quiet down noisy dependencies unless overridden by RUST_LOG
    let default_filter = "info,tower_http=warn";
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer())
        .try_init();
}
