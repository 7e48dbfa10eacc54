//! holdpoint - intercepting proxy for OpenAI-compatible APIs.
//!
//! Runs two HTTP listeners: the caller-facing proxy (agents point their
//! OpenAI base URL at it) and the operator-facing control API. Intercepted
//! requests park until the operator inspects, optionally edits, and
//! releases them; everything else relays to upstream transparently.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use holdpoint::config::HoldpointConfig;
use holdpoint::control::{self, ControlState};
use holdpoint::exchange::ExchangeStore;
use holdpoint::metrics::Metrics;
use holdpoint::proxy::{self, ProxyState};
use holdpoint::relay::{Relay, RelayConfig};

/// Command-line configuration. Everything else comes from `HOLDPOINT_*`
/// environment variables, see [`HoldpointConfig::from_env`].
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Caller-facing proxy port
    #[arg(short, long, env = "HOLDPOINT_PORT", default_value = "8000")]
    port: u16,

    /// Operator-facing control API port
    #[arg(long, env = "HOLDPOINT_CONTROL_PORT", default_value = "8001")]
    control_port: u16,

    /// Bind address for both listeners
    #[arg(short, long, env = "HOLDPOINT_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Upstream base URL (overrides HOLDPOINT_UPSTREAM)
    #[arg(long)]
    upstream_url: Option<String>,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "HOLDPOINT_SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HoldpointConfig::from_env();
    if let Some(upstream) = cli.upstream_url.clone() {
        config.upstream_url = upstream;
    }
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(ExchangeStore::with_metrics(
        config.store_config(),
        metrics.clone(),
    ));

    let relay = Relay::new(RelayConfig {
        base_url: config.upstream_url.clone(),
        timeout: config.upstream_request_timeout,
        connect_timeout: config.upstream_connect_timeout,
        max_response_size: config.resp_buffer_max,
        ..RelayConfig::default()
    })?
    .with_metrics(metrics.clone());

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    // Background sweep of terminal exchanges past the grace period.
    {
        let store = store.clone();
        let interval = config.eviction_interval;
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = store.evict_terminal();
                        if evicted > 0 {
                            info!(evicted, "Evicted terminal exchanges");
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
        });
    }

    // Control API on its own listener.
    let control_addr = format!("{}:{}", cli.bind, cli.control_port);
    let control_listener = TcpListener::bind(&control_addr).await?;
    let control_app = control::router(ControlState {
        store: store.clone(),
        metrics: metrics.clone(),
    });
    let control_handle = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(control_listener, control_app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        })
    };

    // Caller-facing proxy.
    let proxy_addr = format!("{}:{}", cli.bind, cli.port);
    let proxy_listener = TcpListener::bind(&proxy_addr).await?;
    let proxy_app = proxy::router(ProxyState {
        store: store.clone(),
        relay,
        config: config.clone(),
    });

    info!(
        proxy_addr = %proxy_addr,
        control_addr = %control_addr,
        upstream = %config.upstream_url,
        intercept_paths = ?config.intercept_paths,
        "holdpoint listening"
    );

    let token = shutdown.clone();
    axum::serve(proxy_listener, proxy_app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    // Unblock every parked caller before the process exits; each gets a
    // diagnostic 502 instead of a dropped connection.
    let failed = store.fail_all_pending("service shutting down");
    if failed > 0 {
        warn!(failed, "Failed pending exchanges at shutdown");
    }

    match tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), control_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Control server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "Control server task panicked"),
        Err(_) => warn!(
            timeout_secs = cli.shutdown_timeout,
            "Control server did not stop within the shutdown timeout"
        ),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Cancels the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_handlers(shutdown: CancellationToken) {
    let sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                sigint.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        let sigterm = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    sigterm.cancel();
                }
                Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
            }
        });
    }
}
