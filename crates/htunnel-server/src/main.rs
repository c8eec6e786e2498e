//! htunnel-server: TCP streams multiplexed over polled HTTP requests.
//!
//! A client posts `start` to open a session, then exchanges numbered `sync`
//! batches with the server. The server keeps one engine per session that
//! dials the requested destinations and relays their bytes through the
//! session's mailbox.

mod api;
mod config;
mod engine;
mod store;
mod supervisor;

use anyhow::Context;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use engine::DnsResolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::SessionStore;
use supervisor::TunnelSupervisor;
use tracing::{error, info};

/// How long shutdown waits for engines to close their sockets.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// htunnel-server: HTTP-polled TCP tunnel
#[derive(Parser, Debug)]
#[command(name = "htunnel-server", version, about = "HTTP-polled TCP tunnel server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// HTTP path of the tunnel endpoint
    #[arg(long)]
    path: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.htunnel/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds without requests before a session is reaped
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Engine readiness wait, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting htunnel-server");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "htunnel-server failed");
        std::process::exit(1);
    }

    info!("htunnel-server stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(
        Some(&config_path),
        CliOverrides {
            bind: cli.bind,
            port: cli.port,
            path: cli.path,
            max_sessions: cli.max_sessions,
            idle_timeout: cli.idle_timeout,
            poll_interval_ms: cli.poll_interval_ms,
        },
    )
    .context("failed to load config")?;

    let store = Arc::new(SessionStore::new(config.max_sessions));
    let supervisor = Arc::new(TunnelSupervisor::new(
        store.clone(),
        config.engine.clone(),
        DnsResolver,
    ));
    let gc = supervisor::spawn_gc(store, config.gc_interval, config.idle_timeout);

    let state = api::AppState::new(supervisor.clone(), config.engine.drain_limit);
    let app = api::create_router(state, &config.path, config.max_body);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        path = %config.path,
        max_sessions = config.max_sessions,
        allowed = ?config.engine.policy.allowed_destinations,
        "listening"
    );

    // Held `start` requests only return once their engines stop, so the
    // engines are stopped before the server drains in-flight requests.
    let stop_engines = async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        gc.abort();
        if !supervisor.shutdown(SHUTDOWN_GRACE).await {
            error!("some engines did not stop in time");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(stop_engines)
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
