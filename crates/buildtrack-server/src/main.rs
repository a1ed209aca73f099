//! BuildTrack build tracker process.

use anyhow::Context;
use buildtrack_config::{LogFormat, LoggingConfig, TrackerConfig, load_tracker_config};
use buildtrack_db::{BuildNotifier, PgBuildRepo, create_pool, run_migrations};
use buildtrack_executor::{ExecutorEngine, LocalDockerExecutor};
use buildtrack_scheduler::{RunnerOptions, Tracker, TrackerRunner};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildtrack")]
#[command(about = "Runs every started build exactly once", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "BUILDTRACK_CONFIG", default_value = "buildtrack.kdl")]
    config: PathBuf,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Track once, wait for the builds that were started, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_tracing(&config.as_ref().map(|c| c.logging.clone()).unwrap_or_default());
    let config = config.unwrap_or_else(|| {
        warn!(path = %cli.config.display(), "Configuration file not found, using defaults");
        TrackerConfig::default()
    });

    let database_url = cli
        .database_url
        .clone()
        .unwrap_or_else(|| config.database.url.clone());

    info!("Connecting to database...");
    let pool = create_pool(&database_url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;
    info!("Database connected");

    let repo = Arc::new(PgBuildRepo::new(pool.clone()));
    let executor = Arc::new(LocalDockerExecutor::new().context("failed to connect to Docker")?);
    let engine = Arc::new(ExecutorEngine::new(
        executor,
        repo.clone(),
        config.executor.work_dir.clone(),
    ));
    let tracker = Arc::new(Tracker::new(repo, engine));

    if cli.once {
        return run_once(&tracker).await;
    }

    let runner = TrackerRunner::new(
        Arc::clone(&tracker),
        RunnerOptions {
            interval: config.runner.interval,
            drain_timeout: config.runner.drain_timeout,
            ..Default::default()
        },
    );
    let trigger = runner.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let notifier = BuildNotifier::new(pool);
    let notifier_task = tokio::spawn(notifier.run(move || trigger.trigger(), shutdown_rx.clone()));
    let runner_task = tokio::spawn(runner.run(shutdown_rx));

    shutdown_signal().await;
    info!("Shutting down");
    shutdown_tx.send_replace(true);

    runner_task.await?;
    notifier_task.await?;

    Ok(())
}

/// Load the configuration file, or `None` if it does not exist.
fn load_config(path: &Path) -> anyhow::Result<Option<TrackerConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let config = load_tracker_config(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok(Some(config))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn run_once(tracker: &Tracker) -> anyhow::Result<()> {
    tracker.track().await.context("failed to discover started builds")?;

    info!(running = tracker.running_count(), "Waiting for builds to finish");
    while tracker.running() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracker.release().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
