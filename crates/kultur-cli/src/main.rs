use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use kultur_db::Db;
use kultur_sync::{SourceRegistry, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kultur")]
#[command(about = "Kulturkalenderen command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch all enabled sources, update the database and run the dedupe pass.
    Sync,
    /// Render the static site (index.html, events.ics, feed.rss) to the output directory.
    Render,
    /// Serve the preview site and the status API; starts the scheduler when enabled.
    Serve,
    /// List the configured sources.
    Sources,
    /// Show circuit-breaker health for every source.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::new(config).await?;
            let run = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} status={} attempted={} failed={} parsed={} inserted={} updated={} unchanged={} merged={} review={}",
                run.run_id,
                run.status,
                run.sources_attempted,
                run.sources_failed,
                run.drafts_parsed,
                run.events_inserted,
                run.events_updated,
                run.events_unchanged,
                run.events_merged,
                run.review_queued,
            );
        }
        Commands::Render => {
            let db = Db::connect(&config.database_url).await?;
            let count =
                kultur_site::write_site(&db, &config.output_dir, &config.site_url, Utc::now())
                    .await?;
            println!(
                "rendered {} events to {}",
                count,
                config.output_dir.display()
            );
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::new(config).await?);
            if let Some(scheduler) = pipeline.maybe_build_scheduler().await? {
                scheduler.start().await?;
            }
            kultur_site::serve_from_env(pipeline.db().clone()).await?;
        }
        Commands::Sources => {
            let path = config.workspace_root.join("sources.yaml");
            let text = tokio::fs::read_to_string(&path).await?;
            let registry = SourceRegistry::from_yaml(&text)?;
            for source in &registry.sources {
                println!(
                    "{:<16} {:<10} enabled={:<5} priority={:<4} {}",
                    source.source_id,
                    format!("{:?}", source.kind).to_lowercase(),
                    source.enabled,
                    source.priority,
                    source.display_name,
                );
            }
        }
        Commands::Health => {
            let db = Db::connect(&config.database_url).await?;
            for health in db.all_source_health().await? {
                println!(
                    "{:<16} {:<10} failures={} last_error={}",
                    health.source_id,
                    health.state.as_str(),
                    health.consecutive_failures,
                    health.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}
