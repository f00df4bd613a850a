//! Rise Background Worker
//!
//! Handles scheduled jobs including:
//! - Replay of stored webhook failures (every 10 minutes)
//! - Auto-charging setup retries (hourly)
//! - One-time membership expiry (daily at 2:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use rise_billing::BillingService;
use rise_shared::PoolSettings;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const SCHEDULED_JOBS: usize = 4;

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

    info!("Starting Rise Worker");

    let database_url = rise_shared::database_url()?;
    let pool = rise_shared::create_pool(&database_url, PoolSettings::WORKER).await?;

    let billing = match BillingService::from_env(pool) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Square credentials there is nothing to schedule
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay stored webhook failures (every 10 minutes)
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                match billing.webhooks.replay_failed().await {
                    Ok(summary) if summary.attempted > 0 => info!(
                        attempted = summary.attempted,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "Webhook failure replay complete"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Webhook failure replay failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook failure replay (every 10 minutes)");

    // Job 2: Retry failed auto-charging setups (hourly)
    let auto_charging_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = auto_charging_billing.clone();
            Box::pin(async move {
                info!("Running auto-charging retry job");
                if let Err(e) = billing.auto_charging.retry_failed().await {
                    error!(error = %e, "Auto-charging retry failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Auto-charging retry (hourly)");

    // Job 3: Expire lapsed one-time memberships (daily at 2:00 AM UTC)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running membership expiry job");
                if let Err(e) = billing.subscriptions.expire_memberships().await {
                    error!(error = %e, "Membership expiry failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Membership expiry (daily at 2:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Rise Worker started successfully with {} scheduled jobs",
        SCHEDULED_JOBS
    );

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
