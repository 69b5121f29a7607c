use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreBackend};
use gatekeeper::http::HttpServer;
use gatekeeper::ratelimit::RateLimiter;
use gatekeeper::store::{MemoryStore, RedisStore, Store};

/// Request admission control gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Best-effort: a missing .env file is not an error.
    let dotenv = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Gatekeeper admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let policy = config.limits.to_policy()?;

    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; limits are not shared between instances");
            let store = Arc::new(MemoryStore::new());
            let _sweeper = store.clone().spawn_sweeper(config.store.sweep_interval());
            store
        }
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(
                &config.store.redis_addr,
                config.store.redis_password.as_deref(),
                config.store.redis_db,
            )
            .await?,
        ),
    };

    let rate_limiter = Arc::new(RateLimiter::new(policy, store));
    info!("Rate limiter initialized");

    let server = HttpServer::new(
        config.server.http_addr,
        rate_limiter,
        &config.server.token_header,
    )?;

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Gatekeeper admission control stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
