// watcher: Keeps a live chat stream connection open and archives messages.
//
// Runtime wiring: SQLite store, shared ingest path, backfill worker,
// connection manager (stream loop + reconnects), daily summary schedule,
// and signal-driven shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use watcher::auth::Authenticator;
use watcher::backfill::{BackfillFetcher, spawn_worker};
use watcher::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use watcher::connection::ConnectionManager;
use watcher::dedup::EidCache;
use watcher::ingest::{ChannelFilter, Ingestor};
use watcher::storage::{MessageStore, SqliteStore};
use watcher::stream::StreamProcessor;
use watcher::summary::{PlainSummary, SummaryGenerator, run_summary_schedule, write_daily_summary};

#[derive(Debug, Parser)]
#[command(name = "watcher", version, about = "Archive a live chat stream and summarize it daily")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Write the summary for the last 24 hours and exit.
    #[arg(long)]
    generate_summary: bool,
    /// Verbose logging, including every raw stream frame.
    #[arg(long)]
    debug: bool,
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "watcher starting");

    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cfg = match load_config_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    let debug = cli.debug || cfg.debug;

    let store = match SqliteStore::open(&cfg.database_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = store.integrity_check() {
        eprintln!("FATAL: database integrity check failed: {}", e);
        std::process::exit(1);
    }
    let store: Arc<dyn MessageStore> = Arc::new(store);
    info!(path = %cfg.database_path.display(), "database opened");

    let generator: Arc<dyn SummaryGenerator> = Arc::new(PlainSummary);

    if cli.generate_summary {
        match write_daily_summary(store.as_ref(), generator.as_ref(), &cfg.summary.output_path, Utc::now()) {
            Ok(count) => {
                info!(messages = count, path = %cfg.summary.output_path.display(), "summary done");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("FATAL: failed to generate summary: {}", e);
                std::process::exit(1);
            }
        }
    }

    if cfg.channels.is_empty() {
        info!("monitoring all channels");
    } else {
        info!(channels = ?cfg.channels, "monitoring channels");
    }
    if !cfg.ignored_channels.is_empty() {
        info!(ignored = ?cfg.ignored_channels, "ignoring channels");
    }
    info!(schedule = %cfg.summary.time, "summary schedule");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingestor = Arc::new(Ingestor::new(
        ChannelFilter::new(cfg.channels.clone(), cfg.ignored_channels.clone()),
        Arc::new(EidCache::default()),
        store.clone(),
    ));

    let fetcher = match BackfillFetcher::new(
        ingestor.clone(),
        cfg.endpoints.fallback_api_host.clone(),
        cfg.backfill.max_batch_events,
    ) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("FATAL: failed to build backfill client: {}", e);
            std::process::exit(1);
        }
    };
    let (backfill, backfill_task) = spawn_worker(fetcher, shutdown_rx.clone());

    let mut stream_settings = cfg.stream_settings();
    stream_settings.debug = debug;
    let processor = StreamProcessor::new(ingestor, Some(backfill), stream_settings);
    let manager = Arc::new(ConnectionManager::new(
        Authenticator::new(cfg.endpoints.clone(), debug),
        processor,
        cfg.connection_settings(),
        shutdown_tx,
    ));

    let summary_task = tokio::spawn(run_summary_schedule(
        cfg.summary.schedule,
        store.clone(),
        generator,
        cfg.summary.output_path.clone(),
        shutdown_rx.clone(),
    ));

    let signal_manager = manager.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_manager.close();
    });

    let result = manager.run(&cfg.credentials).await;
    manager.close();
    let _ = backfill_task.await;
    let _ = summary_task.await;

    match result {
        Ok(()) => info!("watcher stopped"),
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    }
}
