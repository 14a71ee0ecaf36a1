/// fleetlinkd — embedded LAN control-plane daemon
///
/// Start-up sequence:
///   1. Load .env if present, locate the INI config (first argument or
///      FLEETLINK_CONFIG)
///   2. Initialise structured logging (RUST_LOG)
///   3. Parse the config and build the shared AppState
///   4. Bind the HTTP listener (failure here is fatal) and spawn the server
///   5. Kick off a startup scan when scanning is enabled
///   6. Spawn the slave registration loop (it idles unless the role says
///      otherwise, so a reload can flip the role without a restart)
///   7. Wait for SIGINT/SIGTERM; SIGHUP reloads the config in place

mod api;
mod config;
mod exec;
mod http;
mod scan;
mod slave;
mod state;
mod sync;
mod sysinfo;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEETLINK_CONFIG").ok())
        .map(PathBuf::from);
    let base = match &config_path {
        Some(p) => Config::load(p)?,
        None => {
            warn!("no config file given, running on defaults");
            Config::default()
        }
    };

    info!(
        "fleetlinkd v{} starting (device={:?}, sync_role={:?})",
        env!("CARGO_PKG_VERSION"),
        base.device,
        base.sync_role,
    );

    let state = AppState::new(base, config_path);
    let cfg = state.cfg.snapshot().await;

    let listener = TcpListener::bind((cfg.bind.as_str(), cfg.port))
        .await
        .with_context(|| format!("bind {}:{}", cfg.bind, cfg.port))?;
    info!("[http] listening on {}:{}", cfg.bind, cfg.port);
    let http_task = tokio::spawn(http::serve(listener, state.clone()));

    if cfg.enable_scan {
        state.scanner.try_start(cfg.clone());
    }

    let slave_task = tokio::spawn(slave::run_loop(state.clone()));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP, reloading config");
                if let Err(e) = state.cfg.reload().await {
                    warn!("config reload failed: {e:#}");
                }
            }
        }
    }

    state.request_stop();
    let _ = http_task.await;
    // The slave loop polls the stop flag in one-second slices; give it one
    // interval to come home before letting the runtime tear it down.
    let grace = Duration::from_secs(cfg.register_interval_s.max(1));
    let _ = tokio::time::timeout(grace, slave_task).await;
    info!("fleetlinkd stopped");
    Ok(())
}
