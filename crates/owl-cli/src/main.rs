use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owl_ingest::IngestConfig;
use owl_storage::{PgStore, QueryCatalog};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "owl-cli")]
#[command(about = "Owl market catalog ingestor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the catalog, aggregate listings and persist item summaries.
    Ingest {
        /// Maximum detail fetches in flight.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Only process the first N index entries.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Apply database migrations.
    Migrate,
    /// List the named query templates that would be loaded.
    Queries,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest {
        concurrency: None,
        limit: None,
    }) {
        Commands::Ingest { concurrency, limit } => {
            if let Some(concurrency) = concurrency {
                config.fetch_concurrency = concurrency;
            }
            if limit.is_some() {
                config.descriptor_limit = limit;
            }
            let summary = owl_ingest::run_ingest_once(config).await?;
            info!(run_id = %summary.run_id, final_state = %summary.final_state, "ingest command finished");
            println!(
                "ingest complete: run_id={} descriptors={} items={} records={} detail_failures={} persistence_failures={}",
                summary.run_id,
                summary.descriptors,
                summary.items,
                summary.records,
                summary.detail_failures,
                summary.persistence_failures
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, QueryCatalog::default()).await?;
            store
                .migrate(&config.migrations_dir)
                .await
                .context("running migrate command")?;
            info!(dir = %config.migrations_dir.display(), "migrate command finished");
            println!("migrations applied from {}", config.migrations_dir.display());
        }
        Commands::Queries => {
            let catalog = QueryCatalog::load_dir(&config.queries_dir)?;
            info!(dir = %config.queries_dir.display(), count = catalog.len(), "query templates loaded");
            for name in catalog.names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
