//! CalGate - hardened forwarding proxy for remote calendar (.ics) feeds.
//!
//! Initializes logging, loads configuration, discovers the public address,
//! and runs the accept loop until a shutdown signal arrives.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use calgate::config::ProxyConfig;
use calgate::proxy_service::ProxyService;
use calgate::rate_limiter::ClientRateLimiter;
use calgate::{public_ip, server};

/// Command-line surface; everything else comes from `CALGATE_*` environment
/// variables (see [`ProxyConfig::from_env`]).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Listening port; overrides CALGATE_PORT
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Non-blocking writer so logging cannot stall the runtime; the guard
    // must live for the whole program so buffered lines are flushed.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ProxyConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    info!(
        bind = %cli.bind,
        port = config.port,
        rate_limit = config.rate_limit,
        max_redirects = config.max_redirects,
        max_body_bytes = config.max_body_bytes,
        https_only = config.https_only,
        allowed_hosts = config.allowed_host_suffixes.len(),
        "CalGate starting"
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    // Best effort; without it forwarded-for chains pass through untouched.
    let public_ip = public_ip::discover(&config.public_ip_endpoint).await;

    let limiter = Arc::new(ClientRateLimiter::new(
        config.rate_limit,
        config.rate_window,
        config.rate_stale_after,
    ));
    limiter.spawn_cleanup_task(shutdown.clone());

    let service = ProxyService::new(config.clone(), limiter, public_ip)?;

    let addr = format!("{}:{}", cli.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;

    server::run(listener, service, config, shutdown).await?;

    info!("CalGate stopped");
    Ok(())
}

/// SIGINT and SIGTERM both begin graceful shutdown.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = shutdown;
}
