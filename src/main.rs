//! costwatch — billing usage telemetry daemon.
//!
//! Polls external billing providers on a fixed interval, records
//! usage points in an append-only SQLite time series, and serves
//! status/history queries plus on-demand poll triggers over a local
//! Unix socket.
//!
//! Failure policy:
//! - A provider without credentials registers disabled, never fatal
//! - One provider's failure never blocks its siblings or the loop
//! - A lost store write never turns a successful poll into a failure

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod pollers;
mod query;
mod scheduler;
mod server;
mod store;

use pollers::PollerRegistry;
use store::UsageStore;

/// Configuration loaded from the environment or defaults.
struct Config {
    data_dir: PathBuf,
    db_path: PathBuf,
    socket_path: PathBuf,
    poll_interval: Duration,
}

impl Config {
    fn from_env() -> Self {
        let data_dir = std::env::var("COSTWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = dirs::home_dir().expect("Cannot determine home directory");
                home.join(".openclaw/workspace/dashboard")
            });

        let poll_interval = std::env::var("COSTWATCH_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(scheduler::DEFAULT_POLL_INTERVAL_SECS));

        Self {
            db_path: data_dir.join("usage.db"),
            socket_path: data_dir.join("costwatch.sock"),
            poll_interval,
            data_dir,
        }
    }
}

/// Shared state for the scheduler, query layer and RPC server, built
/// once at startup and passed by reference — no module globals.
pub struct AppContext {
    pub store: UsageStore,
    pub registry: PollerRegistry,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (structured logs)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "costwatch=info".into()),
        )
        .with_target(false)
        .init();

    info!("💸 costwatch v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    // ── Usage Store ─────────────────────────────────────────────────
    let store = UsageStore::open(&config.db_path).context("Failed to open usage store")?;
    info!(db = %config.db_path.display(), "usage store ready");

    // ── Poller Registry ─────────────────────────────────────────────
    let registry = PollerRegistry::bootstrap();

    let ctx = Arc::new(AppContext { store, registry });

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler_ctx = Arc::clone(&ctx);
    let poll_interval = config.poll_interval;
    tokio::spawn(async move {
        scheduler::run_scheduler(scheduler_ctx, poll_interval).await;
    });

    // ── RPC Server ──────────────────────────────────────────────────
    let srv = server::Server::new(config.socket_path, ctx);

    info!(
        interval_secs = config.poll_interval.as_secs(),
        "costwatch daemon ready"
    );
    srv.run().await?;

    Ok(())
}
