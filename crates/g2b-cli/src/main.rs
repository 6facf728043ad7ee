use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use g2b_storage::PgDocumentStore;
use g2b_sync::{SyncConfig, SyncPipeline};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "g2b=info,g2b_sync=info,g2b_adapters=info,g2b_storage=info,g2b_web=info";

#[derive(Debug, Parser)]
#[command(name = "g2b")]
#[command(about = "Nara Marketplace bid announcement collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled collector once.
    Sync,
    /// Run collectors on the SYNC_CRON_1 / SYNC_CRON_2 schedule until interrupted.
    Schedule,
    /// Print the stored watermark of each collector.
    Status,
    /// Apply database migrations.
    Migrate,
    /// Serve the read-only bid API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = g2b_sync::run_sync_once_from_env().await?;
            for profile in &summary.profiles {
                println!(
                    "{}: fetched={} matched={} kept={} upserted={} stale_deleted={}",
                    profile.profile,
                    profile.total_collected,
                    profile.filtered_records,
                    profile.deduplicated_records,
                    profile.sink.upserted,
                    profile.sink.stale_deleted
                );
            }
            println!(
                "sync complete: run_id={} upserted={} reports={}",
                summary.run_id,
                summary.upserted(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status => {
            for status in g2b_sync::status_from_env().await? {
                let latest = status
                    .latest_bid_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "never".to_string());
                match status.state {
                    Some(state) => println!(
                        "{} [{}]: latest bid {} / last collected {} / last run upserted {} / total {}",
                        status.profile,
                        status.collection,
                        latest,
                        state.collected_at,
                        state.upserted_records,
                        state.total_upserted
                    ),
                    None => println!(
                        "{} [{}]: latest bid {} / no collection state",
                        status.profile, status.collection, latest
                    ),
                }
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgDocumentStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            g2b_web::serve_from_env().await?;
        }
    }

    Ok(())
}
