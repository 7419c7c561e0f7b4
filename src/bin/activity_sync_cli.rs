//! Activity Sync CLI
//!
//! One-shot access to the sync engine: run a sync or backfill, realign stale
//! items, inspect run history, or apply the schema.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use activity_sync::config::AppConfig;
use activity_sync::database::models::RunType;
use activity_sync::database::queries::Queries;
use activity_sync::database::Database;
use activity_sync::github::HttpGraphClient;
use activity_sync::realign::Realigner;
use activity_sync::sync::SyncOrchestrator;

#[derive(Parser)]
#[command(name = "activity-sync-cli")]
#[command(about = "Run and inspect organization activity syncs")]
struct Cli {
    /// Configuration file (without extension)
    #[arg(short, long, default_value = "activity-sync")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an incremental sync
    Sync,
    /// Backfill a date range
    Backfill {
        /// Start date (YYYY-MM-DD or RFC 3339)
        #[arg(short, long)]
        start: String,

        /// End date, exclusive (defaults to now)
        #[arg(short, long)]
        end: Option<String>,
    },
    /// Re-check issue ownership against the remote
    Realign {
        /// Maximum candidates to check
        #[arg(short, long)]
        limit: Option<i64>,

        /// Candidates per rate-limit check
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Report changes without writing them
        #[arg(long)]
        dry_run: bool,

        /// Wait for the rate limit to reset instead of halting
        #[arg(long)]
        wait: bool,
    },
    /// Show recent sync runs
    Runs {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },
    /// Create or update the database schema
    Migrate,
}

fn parse_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date: {}", value))?;
    Ok(date.and_hms_opt(0, 0, 0).context("Invalid date")?.and_utc())
}

fn engine(
    config: &AppConfig,
    database: Database,
) -> anyhow::Result<(Arc<SyncOrchestrator>, Arc<Realigner>)> {
    let client = HttpGraphClient::new(config.graphql_url.clone(), config.github_token.clone())
        .context("Failed to build GraphQL client")?;
    Ok(activity_sync::build_engine(config, database, Arc::new(client)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "activity_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config).context("Failed to load configuration")?;
    let database = Database::new(&config.database_url)
        .await
        .context("Failed to open database")?;

    match cli.command {
        Commands::Migrate => {
            database.run_migrations().await?;
            println!("Schema is up to date");
        }
        Commands::Runs { limit } => {
            for run in Queries::recent_runs(database.pool(), limit).await? {
                println!(
                    "{}  {:<9} {:<11} {:<7} started {}{}",
                    run.id,
                    run.run_type.as_str(),
                    run.strategy.as_str(),
                    run.status.as_str(),
                    run.started_at.to_rfc3339(),
                    run.error.map(|e| format!("  error: {}", e)).unwrap_or_default()
                );
                for log in Queries::logs_for_run(database.pool(), &run.id).await? {
                    println!(
                        "    {:<14} {:<7} {} items",
                        log.resource.as_str(),
                        log.status.as_str(),
                        log.items_processed
                    );
                }
            }
        }
        Commands::Sync => {
            let (orchestrator, _) = engine(&config, database)?;
            let summary = orchestrator.run_incremental_sync(RunType::Manual).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Backfill { start, end } => {
            let start = parse_time(&start)?;
            let end = end.as_deref().map(parse_time).transpose()?;
            let (orchestrator, _) = engine(&config, database)?;
            let summary = orchestrator.run_backfill(start, end).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Realign {
            limit,
            chunk_size,
            dry_run,
            wait,
        } => {
            let mut options = config.realign_options();
            if let Some(limit) = limit {
                options.limit = limit;
            }
            if let Some(chunk_size) = chunk_size {
                options.chunk_size = chunk_size;
            }
            options.dry_run = dry_run;
            options.wait_for_rate_limit = wait;

            let (_, realigner) = engine(&config, database)?;
            let summary = realigner.realign(&options).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
