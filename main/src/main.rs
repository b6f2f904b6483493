use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use common::storage::db::Database;
use common::storage::store::StorageManager;
use common::utils::config::get_config;
use ingestion_pipeline::embedding::EmbeddingClient;
use ingestion_pipeline::{run_worker_loop, IngestionPipeline, WorkerConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docpipe", about = "Document ingestion pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations.
    Migrate,
    /// Run the ingestion worker loop.
    RunWorker,
    /// Check database connectivity and applied migrations.
    VerifyDb,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = get_config()?;
    let db = Database::connect(&config.database_url).await?;

    match cli.command {
        Command::Migrate => {
            db.apply_migrations().await?;
            info!("migrations applied");
        }
        Command::VerifyDb => {
            db.verify().await?;
            info!("database reachable, schema up to date");
        }
        Command::RunWorker => {
            db.verify().await?;
            let storage = StorageManager::new(&config)?;
            let embeddings = EmbeddingClient::from_config(&config);
            let pipeline = Arc::new(IngestionPipeline::new(
                db.clone(),
                storage,
                embeddings,
                &config,
            ));

            info!("starting worker process");
            run_worker_loop(db, pipeline, WorkerConfig::new(config.worker_concurrency)).await?;
        }
    }

    Ok(())
}
