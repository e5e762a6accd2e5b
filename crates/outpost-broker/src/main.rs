//! Outpost Broker
//!
//! HTTP control plane that queues work for polling appliances and manages
//! their tunnel sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use outpost_broker::Broker;
use outpost_broker::api::{AppState, build_router};
use outpost_broker::storage::BrokerDatabase;
use outpost_core::config::default_database_path;
use outpost_core::{BrokerConfig, SharedClock, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "outpost-broker")]
#[command(
    version,
    about = "Outpost broker - command queue, agent updates and tunnel sessions"
)]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, env = "OUTPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Bearer token for operator routes.
    #[arg(long)]
    operator_token: Option<String>,

    /// Directory update payload references resolve against.
    #[arg(long)]
    payload_dir: Option<PathBuf>,

    /// Age in seconds after which an unfinished proxy request times out.
    #[arg(long)]
    request_timeout: Option<i64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// OTLP endpoint for traces and metrics.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "OUTPOST_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Args {
    /// CLI flags sit on top of file and environment settings.
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(addr) = self.addr {
            config.listen_addr = addr;
        }
        if let Some(path) = &self.db_path {
            config.database_path = Some(path.clone());
        }
        if let Some(token) = &self.operator_token {
            config.operator_token = Some(token.clone());
        }
        if let Some(dir) = &self.payload_dir {
            config.updates.payload_dir = dir.clone();
        }
        if let Some(secs) = self.request_timeout {
            config.reaper.request_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    outpost_core::tracing_init::init_tracing("outpost_broker=info", args.log_json);

    #[cfg(feature = "metrics")]
    let metrics_guard = args
        .otlp_endpoint
        .as_deref()
        .map(outpost_core::metrics::init_metrics)
        .transpose()?;

    let mut config = BrokerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    let operator_token = config
        .operator_token
        .clone()
        .context("operator_token is required")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        "Starting outpost-broker"
    );

    let db_path = match config.database_path.clone() {
        Some(path) => path,
        None => default_database_path().context("Cannot determine data directory")?,
    };
    info!(path = %db_path.display(), "Opening broker database");
    let db = BrokerDatabase::open(&db_path).await?;

    let clock: SharedClock = Arc::new(SystemClock);
    let broker = Broker::new(db, clock, &config);

    info!(
        interval_secs = config.reaper.interval_secs,
        request_timeout_secs = config.reaper.request_timeout_secs,
        "Starting reaper"
    );
    tokio::spawn(broker.reaper.clone().run());

    let app = build_router(AppState::new(broker, &operator_token));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await?;

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard {
        guard.shutdown()?;
    }

    info!("Broker stopped");
    Ok(())
}
