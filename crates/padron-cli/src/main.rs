use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use padron_adapters::FixtureRegistryClient;
use padron_identity::Materializer;
use padron_storage::{PgStore, SyncLease};
use padron_sync::{run_exclusive, SyncConfig, SyncEngine, SyncRequest, SyncRunSummary};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "padron-cli")]
#[command(about = "Member registry sync and identity tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the registry.
    Sync {
        /// Watermark override, e.g. 2026-02-01T10:00:00 or 2026-02-01.
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        per_page: Option<u32>,
        /// Ignore the watermark and fetch everything.
        #[arg(long)]
        full: bool,
        /// Read pages from a JSON file instead of the registry.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Materialize identities for the given primary or secondary keys.
    Materialize {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Refresh every identity that already exists.
    Reconcile {
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        since: None,
        per_page: None,
        full: false,
        fixture: None,
    }) {
        Commands::Sync {
            since,
            per_page,
            full,
            fixture,
        } => {
            let request = SyncRequest {
                explicit_watermark: since,
                page_size: per_page.filter(|p| *p > 0).unwrap_or(config.page_size),
                fetch_all: full,
            };
            let summary = match fixture {
                Some(path) => {
                    let store = Arc::new(connect(&config).await?);
                    let client = FixtureRegistryClient::from_path(&path)?;
                    let engine = SyncEngine::with_store(Arc::new(client), store.clone());
                    run_exclusive(&engine, store.as_ref(), config.lock_ttl, &request).await?
                }
                None => padron_sync::run_sync_once(&config, &request).await?,
            };
            print_summary(&summary);
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let (store, engine) = padron_sync::connect_from_config(&config).await?;
            let lease: Arc<dyn SyncLease> = store;
            let Some(mut sched) =
                padron_sync::maybe_build_scheduler(&config, Arc::new(engine), lease).await?
            else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Materialize { keys } => {
            let store = Arc::new(connect(&config).await?);
            let materializer = Materializer::new(store.clone(), store);
            let outcome = materializer.materialize_many(&keys).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.errors.is_empty() {
                anyhow::bail!("{} of {} keys failed", outcome.errors.len(), keys.len());
            }
        }
        Commands::Reconcile { batch_size } => {
            let store = Arc::new(connect(&config).await?);
            let report = Materializer::new(store.clone(), store)
                .reconcile_existing(batch_size)
                .await?;
            println!(
                "reconcile complete: updated={} skipped={} errors={}",
                report.updated,
                report.skipped,
                report.errors.len()
            );
            for (row_id, message) in &report.errors {
                println!("  row {row_id}: {message}");
            }
        }
        Commands::Serve { port } => match port {
            Some(port) => {
                let store = Arc::new(connect(&config).await?);
                padron_web::serve(padron_web::AppState::from_store(store), port).await?;
            }
            None => padron_web::serve_from_env().await?,
        },
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} pages={} received={} upserted={} (secondary={} primary={}) anomalies={} watermark={}",
        summary.run_id,
        summary.pages_processed,
        summary.records_received,
        summary.rows_upserted(),
        summary.upserted_secondary,
        summary.upserted_primary,
        summary.anomaly_count(),
        summary.final_watermark
    );
    println!(
        "  started from {}; inserted={} updated={} duplicates={} barcode_moves={}",
        summary.starting_watermark.as_deref().unwrap_or("full"),
        summary.inserted,
        summary.updated,
        summary.duplicates_collapsed,
        summary.barcode_reassignments
    );
    for (reason, count) in &summary.anomalies {
        println!("  anomaly {reason}: {count}");
    }
}
