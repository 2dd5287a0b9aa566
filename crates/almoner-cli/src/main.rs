use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use almoner_adapters::{CrmApi, CrmConfig, HttpCrm, ProviderClient, ProviderConfig, TransactionSource};
use almoner_storage::{Ledger, PgLedger, SnapshotStore};
use almoner_sync::{AppConfig, BackfillAggregator, BackfillConfig, IngestService, SyncQueue};
use almoner_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "almoner")]
#[command(about = "Donation ledger and CRM lifetime-total sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook listener and the CRM sync worker.
    Serve,
    /// Recompute lifetime totals from provider history and push them to the CRM.
    Backfill {
        /// First day of history to aggregate (inclusive), e.g. 2019-01-01.
        #[arg(long)]
        start_date: NaiveDate,
        /// Count only transactions in this currency code.
        #[arg(long)]
        currency: Option<String>,
        /// Write the audit snapshot but skip every CRM push.
        #[arg(long)]
        skip_crm: bool,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Serve => {
            let ledger = PgLedger::connect(&config.database_url)
                .await
                .context("connecting to ledger database")?;
            let crm = build_crm(&config)?;
            let ledger: Arc<dyn Ledger> = Arc::new(ledger);
            let (queue, _worker) = SyncQueue::spawn(ledger.clone(), crm.clone());
            let ingest = IngestService::new(ledger, crm, queue).with_live_push(config.live_push);
            tracing::info!(live_push = config.live_push, "starting webhook service");
            almoner_web::serve_from_env(AppState::new(ingest)).await?;
        }
        Commands::Backfill {
            start_date,
            currency,
            skip_crm,
        } => {
            let start = start_date
                .and_hms_opt(0, 0, 0)
                .context("invalid start date")?
                .and_utc();
            let provider: Arc<dyn TransactionSource> = Arc::new(ProviderClient::new(
                ProviderConfig::new(
                    config.provider_base_url.clone(),
                    config.provider_client_id.clone(),
                    config.provider_client_secret.clone(),
                ),
            )?);
            let crm = build_crm(&config)?;
            let aggregator = BackfillAggregator::new(
                provider,
                crm,
                SnapshotStore::new(config.snapshots_dir.clone()),
                BackfillConfig {
                    currency,
                    skip_crm,
                    ..BackfillConfig::new(start)
                },
            );
            let summary = aggregator.run().await?;
            println!(
                "backfill complete: run_id={} windows={} failed_windows={} donors={} pushed={} push_failures={} snapshot={}",
                summary.run_id,
                summary.windows,
                summary.failed_windows,
                summary.donors,
                summary.pushed,
                summary.push_failures,
                summary.snapshot_path
            );
        }
        Commands::Migrate => {
            let ledger = PgLedger::connect(&config.database_url)
                .await
                .context("connecting to ledger database")?;
            ledger.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn build_crm(config: &AppConfig) -> Result<Arc<dyn CrmApi>> {
    let crm = HttpCrm::new(CrmConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        ..CrmConfig::new(config.crm_base_url.clone(), config.crm_api_key.clone())
    })?;
    Ok(Arc::new(crm))
}
