use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "ntm")]
#[command(about = "Global NTM master: historical backfill and Sheets-to-Firestore sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the historical scouter workbook into the master workbook.
    Backfill,
    /// Mirror the configured worksheets into Firestore.
    Sync {
        /// Keep syncing on a fixed interval until interrupted.
        #[arg(long)]
        daemon: bool,
    },
    /// Print the detected column mapping of the historical workbook as YAML.
    DetectColumns,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { daemon: false }) {
        Commands::Backfill => {
            let summary = tokio::task::spawn_blocking(ntm_backfill::run_backfill_from_env)
                .await
                .context("backfill task panicked")??;
            println!(
                "backfill complete: run_id={} price_records={} eps_records={} merged={}",
                summary.run_id, summary.price_records, summary.eps_records, summary.merged_records
            );
            for country in &summary.countries {
                println!(
                    "  {}: added={} total={}",
                    country.country.sheet_name(),
                    country.added,
                    country.total
                );
            }
        }
        Commands::Sync { daemon: false } => {
            let summary = ntm_sync::run_sync_once_from_env().await?;
            if let Some(reason) = &summary.aborted {
                bail!("sync run {} aborted: {reason}", summary.run_id);
            }
            println!(
                "sync complete: run_id={} synced={} failed={}",
                summary.run_id,
                summary.total_synced(),
                summary.failed()
            );
            for c in &summary.collections {
                println!(
                    "  {}: {:?} synced={} skipped={} commits={}{}",
                    c.collection,
                    c.status,
                    c.synced,
                    c.skipped,
                    c.commits,
                    c.error.as_deref().map(|e| format!(" error={e}")).unwrap_or_default()
                );
            }
        }
        Commands::Sync { daemon: true } => {
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));
            let passes = ntm_sync::run_sync_daemon_from_env(cancel).await?;
            println!("sync daemon stopped after {passes} passes");
        }
        Commands::DetectColumns => {
            let plan = tokio::task::spawn_blocking(ntm_backfill::detect_columns_from_env)
                .await
                .context("column detection task panicked")??;
            print!("{}", serde_yaml::to_string(&plan)?);
        }
    }

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("received Ctrl+C, stopping sync daemon"),
        Err(err) => {
            error!(error = %err, "failed to install Ctrl+C handler");
            return;
        }
    }
    cancel.cancel();
    info!("shutdown propagated");
}
