//! Kline Ingest Binary
//!
//! Runs the kline pipeline in one of two modes.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p kline-ingest -- backfill   # catch PendingInit symbols up to now, then exit
//! cargo run -p kline-ingest -- runtime    # keep Active symbols current and relay ticks
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `REDIS_URL`: Redis holding cursors, the symbol registry and the tick bus
//!
//! ## Optional
//! - `KLINE_WS_URL`: Exchange websocket (default: wss://api.huobi.pro/ws)
//! - `KLINE_SQLITE_PATH`: Bar database (default: data/klines.db)
//! - `KLINE_MAX_IN_FLIGHT`: Outstanding fetch limit (default: 2)
//! - `KLINE_GRANULARITIES`: Comma-separated granularities (default: all)
//! - `KLINE_LOG_DIR`: Rotated log directory (default: logs)
//! - `KLINE_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Export traces over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: kline_ingest=info)

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kline_ingest::application::ports::{
    BarStore, CursorStore, ExchangeGateway, SymbolRegistry, TickPublisher,
};
use kline_ingest::application::services::{
    AdmissionControl, IngestHandler, ResponseApplier, RunMode, TaskScheduler, TickRelay,
};
use kline_ingest::infrastructure::exchange::{StreamConfig, StreamConnection};
use kline_ingest::infrastructure::health::{HealthServer, HealthServerState};
use kline_ingest::infrastructure::persistence::{RedisKeyStore, SqliteBarStore};
use kline_ingest::infrastructure::telemetry::{self, TelemetryConfig};
use kline_ingest::{IngestConfig, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetch responses buffered between the connection and the applier.
const RESPONSE_QUEUE_CAPACITY: usize = 64;

/// Exchange kline ingester.
#[derive(Debug, Parser)]
#[command(name = "kline-ingest", version, about)]
struct Cli {
    /// Which loop to run.
    #[arg(value_enum)]
    mode: Mode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// One-shot historical catch-up for newly added symbols.
    Backfill,
    /// Minute-cadence incremental fetch plus live tick relay.
    Runtime,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Backfill => Self::Backfill,
            Mode::Runtime => Self::Runtime,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mode = RunMode::from(cli.mode);

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    let config = IngestConfig::from_env()?;

    let _telemetry_guard =
        telemetry::init(&TelemetryConfig::from_env().for_mode(mode, &config.log_dir));

    tracing::info!(mode = %mode, "Starting kline ingest");

    let _metrics_handle = init_metrics()?;

    log_config(&config, mode);

    let shutdown_token = CancellationToken::new();

    // Stores
    let key_store = Arc::new(RedisKeyStore::connect(&config.store.redis_url).await?);
    let bar_store = Arc::new(SqliteBarStore::open(&config.store.sqlite_path).await?);
    let registry: Arc<dyn SymbolRegistry> = key_store.clone();
    let cursors: Arc<dyn CursorStore> = key_store.clone();
    let bars: Arc<dyn BarStore> = bar_store;

    // Admission and exchange connection
    let admission = Arc::new(AdmissionControl::new(config.max_in_flight));
    let (connection, connection_handle) = StreamConnection::new(
        StreamConfig::from_settings(&config.stream),
        &shutdown_token,
    );
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(connection_handle.clone());

    // Tick relay (runtime only)
    let relay = match mode {
        RunMode::Runtime => {
            let publisher: Arc<dyn TickPublisher> = key_store.clone();
            let (relay, relay_rx) = TickRelay::new(
                Arc::clone(&registry),
                Arc::clone(&gateway),
                publisher,
                config.relay.clone(),
            );
            let relay = Arc::new(relay);
            tokio::spawn(Arc::clone(&relay).run(relay_rx));
            Some(relay)
        }
        RunMode::Backfill => None,
    };

    // Response applier
    let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
    let applier = Arc::new(ResponseApplier::new(
        bars,
        Arc::clone(&cursors),
        Arc::clone(&admission),
    ));
    tokio::spawn(applier.run(response_rx));

    // Exchange connection
    let handler = Arc::new(IngestHandler::new(
        Arc::clone(&admission),
        response_tx,
        relay,
    ));
    let connection_task = tokio::spawn(async move {
        if let Err(e) = connection.run(handler).await {
            tracing::error!(error = %e, "Kline stream error");
        }
    });

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        mode,
        connection_handle,
        Arc::clone(&admission),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Scheduler
    let scheduler = TaskScheduler::new(
        registry,
        cursors,
        Arc::clone(&gateway),
        admission,
        config.scheduler.clone(),
        shutdown_token.clone(),
    );

    tracing::info!("Kline ingest ready");

    let outcome = tokio::select! {
        result = scheduler.run(mode) => result,
        () = shutdown_signal() => Ok(()),
    };

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    gateway.stop();
    shutdown_token.cancel();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, connection_task)
        .await
        .is_err()
    {
        tracing::warn!("Kline stream did not stop in time");
    }

    if let Err(e) = &outcome {
        tracing::error!(error = %e, "Scheduler failed");
    }
    outcome?;

    tracing::info!("Kline ingest stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig, mode: RunMode) {
    let granularities: Vec<&str> = config
        .scheduler
        .granularities
        .iter()
        .map(|g| g.as_str())
        .collect();
    tracing::info!(
        mode = %mode,
        url = %config.stream.url,
        max_in_flight = config.max_in_flight,
        granularities = ?granularities,
        health_port = config.server.health_port,
        sqlite_path = %config.store.sqlite_path.display(),
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
