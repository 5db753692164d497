use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use prms_ingest::IngestPipeline;
use prms_storage::{PgStore, PolicyStore};

#[derive(Debug, Parser)]
#[command(name = "prms")]
#[command(about = "Policy Records Management Service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Ingest a CSV or XLSX file directly, without going through HTTP.
    Ingest { file: PathBuf },
}

async fn connect_store() -> Result<PgStore> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set for this command")?;
    let store = PgStore::connect(&database_url)
        .await
        .context("connecting to database")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => prms_web::serve_from_env().await?,
        Commands::Migrate => {
            let store = connect_store().await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Ingest { file } => {
            let store = connect_store().await?;
            store.migrate().await.context("running migrations")?;

            let original_name = file
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("upload.bin")
                .to_string();
            // The pipeline consumes (and deletes) its input, so stage a copy
            // instead of the caller's file.
            let staging = std::env::temp_dir()
                .join(format!("prms-{}-{}", std::process::id(), original_name));
            tokio::fs::copy(&file, &staging)
                .await
                .with_context(|| format!("staging {}", file.display()))?;

            let store: Arc<dyn PolicyStore> = Arc::new(store);
            let report = IngestPipeline::new(store)
                .ingest_file(staging, &original_name)
                .await?;

            let stats = &report.stats;
            println!(
                "ingest complete: rows={} agents={} users={} accounts={} categories={} carriers={} policies={} errors={}",
                report.rows_processed,
                stats.agents,
                stats.users,
                stats.user_accounts,
                stats.policy_categories,
                stats.policy_carriers,
                stats.policies,
                stats.errors.len()
            );
            for error in &stats.errors {
                eprintln!("  {error}");
            }
        }
    }

    Ok(())
}
