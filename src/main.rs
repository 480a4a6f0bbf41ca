use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use logcandle::config;
use logcandle::export::health::HealthMetrics;
use logcandle::ingest::Ingester;
use logcandle::store::SledStore;

/// Access-log candle aggregation service.
#[derive(Parser)]
#[command(name = "logcandle", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("logcandle {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main service run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = config::Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting logcandle",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    let cancel = tokio_util::sync::CancellationToken::new();

    // Set up signal handling.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }

            cancel.cancel();
        });
    }

    // Open the persistent store; an inaccessible or corrupt backing file
    // is a startup failure, not something to limp past.
    let store = Arc::new(
        SledStore::open(&cfg.db_file)
            .with_context(|| format!("opening candle store {}", cfg.db_file.display()))?,
    );

    // Start the health metrics server.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    if cfg.health.enabled {
        health
            .start()
            .await
            .context("starting health metrics server")?;
    }

    // Start ingestion when a source is configured.
    let ingest_task = cfg.source.clone().map(|source| {
        let ingester = Ingester::new(
            source,
            cfg.parser.clone(),
            Arc::clone(&store),
            Arc::clone(&health),
        );
        tokio::spawn(ingester.run(cancel.child_token()))
    });

    // Wait for shutdown.
    cancel.cancelled().await;

    // Graceful shutdown: the ingester flushes the pending minute itself.
    if let Some(task) = ingest_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "ingestion pipeline failed"),
            Err(e) => tracing::error!(error = %e, "ingestion task panicked"),
        }
    }

    health.stop().await?;

    tracing::info!("logcandle stopped");

    Ok(())
}
