//! zubotd - singleton automation daemon
//!
//! Responsibilities:
//! - Own the central service (store, heartbeat, slot pool, gateway, memory)
//! - Expose the HTTP control API
//! - Exit 0 on clean stop, non-zero on fatal init failure (bad DB, bad config)

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use zubot_core::{CentralService, ZubotConfig};

#[derive(Parser, Debug)]
#[command(name = "zubotd", about = "zubot automation daemon")]
struct Args {
    /// Workspace root; config, database, and task entrypoints resolve
    /// against it.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Configuration file, relative to the workspace root unless absolute.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override central_service.scheduler_db_path.
    #[arg(long)]
    db: Option<String>,

    /// HTTP listen address.
    #[arg(long, default_value = "127.0.0.1:8722")]
    listen: String,

    /// Start the core loops regardless of central_service.enabled.
    #[arg(long)]
    force_start: bool,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var("ZUBOT_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn init_tracing(root: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    // Dual-layer logging: stderr + file (daily rotation).
    let log_dir = root.join("memory/logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "zubotd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // Panics land in the log file too, not only on stderr.
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {location}: {payload}");
        error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("workspace root not found: {}", args.root.display()))?;
    let _log_guard = init_tracing(&root);

    let config_path = if args.config.is_absolute() {
        args.config.clone()
    } else {
        root.join(&args.config)
    };
    let mut config = ZubotConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if let Some(db) = args.db {
        config.central_service.scheduler_db_path = db;
    }

    let autostart = config.central_service.enabled || args.force_start;
    let service = CentralService::new(config, root.clone()).context("central service init failed")?;
    info!(
        root = %root.display(),
        db = %service.store().db_path().display(),
        "zubotd initialized"
    );

    if autostart {
        service.start();
    } else {
        info!("central_service.enabled is false; core loops await POST /api/central/start");
    }

    let app = http::router(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "HTTP control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    service.stop().await;
    info!("zubotd exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c; shutting down"),
        _ = terminate => info!("Received SIGTERM; shutting down"),
    }
}
