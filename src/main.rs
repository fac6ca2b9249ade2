//! TickHub
//!
//! Usage:
//!   tickhub serve [--config tickhub.toml]
//!   tickhub backup
//!   tickhub contributions --start 2024-01-01 --end 2024-01-02
//!
//! Environment Variables:
//!   TICKHUB_CONFIG_PATH - Path to TOML config file (default: tickhub.toml)
//!   TICKHUB_BIND_ADDR   - DataProvider listen address
//!   TICKHUB_DATA_DIR    - Directory holding the quarter databases
//!   TICKHUB_MODE        - development | testing | staging | production
//!   RUST_LOG            - Log filter (default: tickhub_backend=debug,tower_http=debug)

use std::{path::Path, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickhub_backend::{
    alert::{OperatorAlert, TerminalBell},
    cache::HourlyQuotationCache,
    clock::{Clock, SystemClock},
    config::TickHubConfig,
    ingest::{ConnectionEvent, IngestionPipeline},
    models::parse_timestamp,
    server::{AppState, ServiceState, ServiceStatus, StreamingServer},
    storage::ShardedTickStore,
};

#[derive(Parser, Debug)]
#[command(name = "tickhub")]
#[command(about = "Tick ingestion, sharded storage and quotation streaming")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the DataProvider endpoint and the ingestion pipeline
    Serve,
    /// Back up every quarter database from the start year to now
    Backup,
    /// Show which hours received ticks
    Contributions {
        /// First hour (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last hour, inclusive
        #[arg(long)]
        end: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Backup => backup(config).await,
        Command::Contributions { start, end } => contributions(config, &start, &end).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<TickHubConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            let mut config = TickHubConfig::load(path)
                .with_context(|| format!("reading {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => TickHubConfig::from_env(),
    };
    config.validate()?;
    info!(
        provider = %config.provider,
        mode = ?config.mode,
        symbols = config.symbols.len(),
        "⚙️ Configuration loaded"
    );
    Ok(config)
}

fn open_store(config: &TickHubConfig, alert: Arc<dyn OperatorAlert>) -> Result<ShardedTickStore> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    ShardedTickStore::new(config, clock, alert).context("opening tick store")
}

async fn serve(config: TickHubConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let alert: Arc<dyn OperatorAlert> = Arc::new(TerminalBell);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = open_store(&config, alert.clone())?;
    let pipeline = IngestionPipeline::spawn(
        config.ingest.clone(),
        &config.symbols,
        Arc::new(store.clone()),
        alert.clone(),
        cancel.child_token(),
    );
    let cache = Arc::new(HourlyQuotationCache::new(
        Arc::new(store),
        clock,
        config.cache.max_hours_in_cache,
    ));

    let state = AppState {
        cache,
        pipeline: pipeline.clone(),
        status: Arc::new(ServiceStatus::new()),
        alert,
        cancel: cancel.clone(),
    };

    tokio::spawn(log_connection_events(pipeline.subscribe_events()));
    tokio::spawn(log_service_state(state.status.subscribe()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown requested");
            shutdown.cancel();
        }
    });

    let server = StreamingServer::new(config.bind_addr.clone(), config.server.clone(), state);
    let result = server.run().await;

    cancel.cancel();
    match pipeline.flush().await {
        Ok(rows) => info!(rows, total = pipeline.flushed_rows(), "💾 Final flush complete"),
        Err(e) => error!(
            error = %e,
            unflushed = pipeline.pending_len(),
            "❌ Final flush failed, pending quotations are lost on exit"
        ),
    }

    result.context("DataProvider stopped")?;
    Ok(())
}

async fn backup(config: TickHubConfig) -> Result<()> {
    let store = open_store(&config, Arc::new(TerminalBell))?;
    let tally = store.backup().await.context("backup aborted")?;

    info!(
        success = tally.success,
        failure = tally.failure,
        no_action_required = tally.no_action_required,
        action_not_possible = tally.action_not_possible,
        "🗄️ Backup finished"
    );
    println!("{}", serde_json::to_string_pretty(&tally)?);
    Ok(())
}

async fn contributions(config: TickHubConfig, start: &str, end: &str) -> Result<()> {
    let start = parse_cli_time(start)?;
    let end = parse_cli_time(end)?;
    let store = open_store(&config, Arc::new(TerminalBell))?;

    let rows = store.get_contributions(start, end).await?;
    let contributed = rows.iter().filter(|r| r.has_contribution).count();
    for row in &rows {
        println!(
            "{}\t{}",
            row.hour.format("%Y-%m-%d %H:00"),
            if row.has_contribution { "yes" } else { "no" }
        );
    }
    info!(hours = rows.len(), contributed, "📈 Contributions listed");
    Ok(())
}

fn parse_cli_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).context("midnight")?.and_utc());
    }
    Ok(parse_timestamp(raw)?)
}

async fn log_connection_events(mut rx: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::Connected { symbol, origin, first }) => {
                info!(symbol = %symbol, origin = %origin, at = %first.timestamp_utc, "🟢 Indicator connected");
            }
            Ok(ConnectionEvent::Disconnected { symbol, reason, ticks }) => {
                info!(symbol = %symbol, reason, ticks, "🔴 Indicator disconnected");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "connection event logger lagged")
            }
            Err(_) => break,
        }
    }
}

async fn log_service_state(mut rx: watch::Receiver<ServiceState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        match state {
            ServiceState::Faulted | ServiceState::Unknown => {
                error!(?state, "❌ DataProvider is no longer serving")
            }
            _ => info!(?state, "DataProvider state changed"),
        }
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickhub_backend=debug,tickhub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate root when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
