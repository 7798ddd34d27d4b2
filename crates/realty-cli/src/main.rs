use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use realty_storage::PgListingStore;
use realty_sync::{BatchPipeline, ChannelTaskReporter, Fingerprinter, IngestConfig, WorkerPool};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "realty-cli")]
#[command(about = "Realty listing consolidator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Decode event files and consolidate them, one batch per task.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Start the HTTP query surface.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            tracing::info!("migrations applied");
        }
        Commands::Ingest { paths, workers } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            ingest(&config, &paths).await?;
        }
        Commands::Serve => {
            realty_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn connect(config: &IngestConfig) -> Result<PgListingStore> {
    PgListingStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to listing database")
}

async fn ingest(config: &IngestConfig, paths: &[PathBuf]) -> Result<()> {
    let mut events = Vec::new();
    for path in paths {
        events.extend(realty_adapters::load_event_file(path)?);
    }
    let batches = realty_adapters::group_by_task(events);
    tracing::info!(files = paths.len(), batches = batches.len(), "events decoded");

    let store = connect(config).await?;
    let pipeline = Arc::new(BatchPipeline::new(
        Arc::new(store),
        Fingerprinter::new(config.fingerprint),
    ));
    let (reporter, mut reports) = ChannelTaskReporter::new();
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let pool = WorkerPool::spawn(pipeline, Arc::new(reporter), config.worker_config(), rx);

    let printer = tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::error!(error = %err, "failed to encode task report"),
            }
        }
    });

    for batch in batches {
        tx.send(batch)
            .await
            .context("worker pool stopped before all batches were queued")?;
    }
    drop(tx);

    let summary = pool.join().await;
    printer.await.context("report printer panicked")?;
    tracing::info!(
        processed = summary.processed,
        failed = summary.failed,
        "ingest finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} batch(es) failed", summary.failed);
    }
    Ok(())
}
