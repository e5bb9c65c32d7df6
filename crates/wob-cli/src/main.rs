use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wob_adapters::PgWarehouseSource;
use wob_storage::OrderStore;
use wob_sync::{spawn_scheduler, CycleOutcome, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "wob")]
#[command(about = "Warehouse Order Bridge command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and exit.
    Sync,
    /// Run the interval scheduler until Ctrl-C.
    Serve,
    /// Ensure the destination schema and exit.
    Migrate,
}

async fn build_pipeline(config: &SyncConfig) -> Result<Arc<SyncPipeline>> {
    let store = OrderStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening destination store {}", config.database_url))?;
    let source = PgWarehouseSource::connect(&config.source_url)
        .await
        .context("connecting to warehouse source")?;
    Ok(Arc::new(SyncPipeline::new(
        store,
        Arc::new(source),
        config.fetch_plan(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = build_pipeline(&config).await?;
            match pipeline.try_run_cycle().await? {
                CycleOutcome::Completed(report) => println!(
                    "sync complete: run_id={} fetched={} dropped={} synced={}",
                    report.run_id, report.fetched, report.dropped, report.synced
                ),
                CycleOutcome::Busy => println!("sync skipped: another cycle is running"),
            }
        }
        Commands::Serve => {
            let pipeline = build_pipeline(&config).await?;
            let handle = spawn_scheduler(pipeline, "orders", config.orders_interval);
            info!(
                interval_ms = config.orders_interval.as_millis() as u64,
                "order sync scheduler started"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            handle.shutdown();
            handle.join().await;
        }
        Commands::Migrate => {
            let store = OrderStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening destination store {}", config.database_url))?;
            store.ensure_schema().await.context("ensuring schema")?;
            println!("schema ensured: {} orders present", store.count_orders().await?);
        }
    }

    Ok(())
}
