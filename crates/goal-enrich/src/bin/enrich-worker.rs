//! Enrichment worker binary
//!
//! Run with: cargo run -p goal-enrich --features cli --bin enrich-worker -- --file report.pdf

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use goal_enrich::pipeline::{hash_file, SourceResolver};
use goal_enrich::providers::Collaborators;
use goal_enrich::storage::{DocumentStore, SqliteStore};
use goal_enrich::{Document, EnrichConfig, JobOptions, JobService, Priority};

/// Runs the document enrichment pipeline until Ctrl+C
#[derive(Parser, Debug)]
#[command(name = "enrich-worker", version, about)]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(long, env = "ENRICH_CONFIG")]
    config: Option<PathBuf>,

    /// Enqueue an already registered document (repeatable)
    #[arg(long = "document")]
    documents: Vec<Uuid>,

    /// Register a file as a new document and enqueue it (repeatable)
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    /// Priority for the enqueued jobs: urgent, high, normal, low
    #[arg(long, default_value = "normal")]
    priority: Priority,

    /// Re-run classification instead of the full pipeline for --document ids
    #[arg(long)]
    reclassify: bool,

    /// Keep source files after a verified run
    #[arg(long)]
    keep_source: bool,

    /// Worker count override
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "goal_enrich=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EnrichConfig::from_file(path)?,
        None => EnrichConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers.worker_count = Some(workers);
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Upload dir: {}", config.pipeline.upload_dir.display());
    tracing::info!("  - Workers: {}", config.workers.resolved_worker_count());
    tracing::info!("  - Classifier concurrency: {}", config.pipeline.classify_concurrency);

    let store = Arc::new(
        SqliteStore::new(&config.storage.database_path).context("Failed to open database")?,
    );
    let collaborators = Collaborators::from_config(&config.providers)?;
    let resolver = SourceResolver::new(&config.pipeline);
    let service = JobService::with_pipeline(
        config,
        store.clone(),
        collaborators,
        Some(store.clone()),
    )?;

    let restored = service.restore(store.as_ref())?;
    if restored > 0 {
        tracing::info!("Resumed {} unfinished jobs", restored);
    }

    let options = JobOptions {
        keep_source: cli.keep_source,
        ..Default::default()
    };

    for path in &cli.files {
        let document = register_file(store.as_ref(), &resolver, path).await?;
        let job_id = service.submit_document_job(document.id, cli.priority, options.clone());
        tracing::info!("Queued {} as document {} (job {})", path.display(), document.id, job_id);
    }

    for document_id in &cli.documents {
        let job_id = if cli.reclassify {
            service.submit_reclassify(*document_id, cli.priority, options.clone())
        } else {
            service.submit_document_job(*document_id, cli.priority, options.clone())
        };
        tracing::info!("Queued document {} (job {})", document_id, job_id);
    }

    service.start();
    println!("\nWorker pool running. Press Ctrl+C to stop\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    tracing::info!("Shutting down, waiting for running jobs");
    service.shutdown().await;

    let stats = service.queue_stats();
    tracing::info!(
        "Final queue: {} queued, {} completed, {} failed, {} cancelled",
        stats.queued,
        stats.completed,
        stats.failed,
        stats.cancelled
    );

    Ok(())
}

/// Register a copy of the file under the upload dir so a verified run
/// deletes the copy, not the caller's file
async fn register_file(
    store: &SqliteStore,
    resolver: &SourceResolver,
    path: &PathBuf,
) -> anyhow::Result<Document> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("Source file {} not found", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", path.display()))?;

    let hash_path = path.clone();
    let hash = tokio::task::spawn_blocking(move || hash_file(&hash_path)).await??;

    let document = Document::new(filename).with_content_hash(hash);
    let staged = resolver
        .stage_upload(&document, &path)
        .await
        .with_context(|| format!("Failed to stage {}", path.display()))?;

    let document = document.with_storage_path(staged);
    store.put_document(&document).await?;
    Ok(document)
}
