//! Spindle playback engine - main entry point
//!
//! Runs the scheduler as a standalone daemon against a simulated
//! voice sink: tracks come from a CSV seed file, playback is timed
//! silence, and every engine event is logged. Useful for soak-testing
//! autofill, caching, and fade behavior without a chat transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spindle_common::{EngineConfig, EventBus};
use spindle_engine::cache::{CacheStore, HttpFetcher};
use spindle_engine::db::{connect_database, SqliteStateStore};
use spindle_engine::resolver::CsvResolver;
use spindle_engine::scheduler::{EngineDeps, GuildScheduler};
use spindle_engine::sink::SimulatedSinkProvider;

/// Command-line arguments for spindle-engine
#[derive(Parser, Debug)]
#[command(name = "spindle-engine")]
#[command(about = "Continuous playback scheduling engine")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SPINDLE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(short, long, default_value = "spindle.db", env = "SPINDLE_DB")]
    database: PathBuf,

    /// Guild to drive in this demo run
    #[arg(short, long, default_value = "1")]
    guild: u64,

    /// Simulated seconds each track "plays" for
    #[arg(long, default_value = "10")]
    track_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle_engine=debug,spindle_common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!(
        "Starting spindle engine (prefetch: {:?}, autofill delay: {}s)",
        config.prefetch.mode, config.autofill.delay_secs
    );

    let pool = connect_database(&args.database)
        .await
        .context("Failed to open database")?;
    let store = Arc::new(SqliteStateStore::new(pool));

    let cache = Arc::new(CacheStore::new(
        config.prefetch.clone(),
        Arc::new(HttpFetcher::new()),
    ));
    let events = EventBus::default();
    let scheduler = Arc::new(GuildScheduler::new(EngineDeps {
        config,
        resolver: Arc::new(CsvResolver::new()),
        store,
        sinks: Arc::new(SimulatedSinkProvider::new(Duration::from_secs(
            args.track_secs,
        ))),
        cache,
        events: events.clone(),
    }));

    // log every engine event until shutdown
    let mut event_rx = events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!(
                guild_id = event.guild_id(),
                event = event.event_type(),
                "engine event"
            );
        }
    });

    // waking the guild arms its autofill radio
    let snapshot = scheduler
        .snapshot(args.guild)
        .await
        .context("Failed to start guild scheduler")?;
    info!(
        guild_id = snapshot.guild_id,
        queue_len = snapshot.queue.len(),
        volume = snapshot.volume,
        "guild scheduler ready"
    );

    shutdown_signal().await;
    info!("Shutting down");
    scheduler.shutdown().await;
    event_log.abort();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
