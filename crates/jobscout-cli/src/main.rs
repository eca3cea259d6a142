use anyhow::Result;
use clap::{Parser, Subcommand};
use jobscout_core::{DEFAULT_CATEGORY_SLUG, JOB_CATEGORIES};
use jobscout_sync::{
    describe_sources, SourceRegistry, SyncConfig, DEFAULT_SCRAPE_CRON, DEFAULT_SCRAPE_SCHEDULE_LABEL,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "Job listing aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation pass now.
    Sync {
        /// Reconcile into memory instead of the database.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the recurring schedule until Ctrl-C.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// List sources and whether they are enabled.
    Sources,
    /// List the job categories users can choose from.
    Categories,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        json: false,
    }) {
        Commands::Sync { dry_run, json } => {
            let summary = jobscout_sync::run_sync_once_from_env(dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} sources={} categories={} scraped={} saved={} first_error={}",
                    summary.run_id,
                    summary.enabled_sources.len(),
                    summary.categories.join(","),
                    summary.scraped,
                    summary.saved,
                    summary.first_error.as_deref().unwrap_or("-"),
                );
                for pass in &summary.passes {
                    println!(
                        "  owner={} scraped={} unique={} inserted={} updated={} skipped={}",
                        pass.owner_id.as_deref().unwrap_or("global"),
                        pass.scraped,
                        pass.unique,
                        pass.inserted,
                        pass.updated,
                        pass.skipped,
                    );
                }
            }
            if summary.needs_operator_attention() {
                eprintln!("warning: listings were scraped but none were saved");
            }
        }
        Commands::Schedule => jobscout_sync::run_scheduler_from_env().await?,
        Commands::Migrate => jobscout_sync::migrate_from_env().await?,
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(&config.sources_file)?;
            let schedule = if config.scrape_cron == DEFAULT_SCRAPE_CRON {
                DEFAULT_SCRAPE_SCHEDULE_LABEL
            } else {
                "custom"
            };
            println!("schedule: {} ({schedule})", config.scrape_cron);
            for status in describe_sources(&config, &registry) {
                println!(
                    "{:<12} {:<8} {:<16} {}",
                    status.source_id.as_str(),
                    if status.enabled { "enabled" } else { "disabled" },
                    serde_json::to_string(&status.access)?.trim_matches('"'),
                    status.description,
                );
            }
        }
        Commands::Categories => {
            for category in JOB_CATEGORIES {
                let marker = if category.slug == DEFAULT_CATEGORY_SLUG { "*" } else { " " };
                println!("{marker} {:<24} {}", category.slug, category.label);
            }
        }
    }

    Ok(())
}
