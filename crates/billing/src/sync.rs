//! Periodic reconciliation against Square
//!
//! Webhooks can be lost or arrive out of order. The full sync walks every
//! membership linked to a Square subscription, compares it with the remote
//! state and overwrites local drift.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::billing_date::{next_billing_date, Cadence};
use crate::client::PaymentGateway;
use crate::error::{BillingError, BillingResult, RemoteError};
use crate::ledger::{
    expected_local_status, Ledger, MembershipRecord, SubscriptionHealth, WebhookHealth,
    REMOTE_ACTIVE,
};
use crate::models::RemoteSubscription;

/// Cumulative counters since process start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_full_sync: Option<OffsetDateTime>,
    pub discrepancies_found: u64,
    pub discrepancies_fixed: u64,
    pub failed_syncs: u64,
}

/// Counts for a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncRunSummary {
    pub checked: usize,
    pub skipped_missing: usize,
    pub discrepancies_found: u64,
    pub discrepancies_fixed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub sync_health: SyncStats,
    pub subscription_health: SubscriptionHealth,
    pub webhook_health: WebhookHealth,
    pub recommendation: &'static str,
}

#[derive(Clone)]
pub struct SyncEngine {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    stats: Arc<RwLock<SyncStats>>,
}

impl SyncEngine {
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            gateway,
            ledger,
            stats: Arc::new(RwLock::new(SyncStats::default())),
        }
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    pub async fn run_full_sync(&self) -> BillingResult<SyncRunSummary> {
        self.run_full_sync_on(chrono::Utc::now().date_naive()).await
    }

    /// Full sync with billing dates computed from `today`
    pub async fn run_full_sync_on(&self, today: NaiveDate) -> BillingResult<SyncRunSummary> {
        tracing::info!("Starting full subscription sync");
        self.stats.write().await.last_full_sync = Some(OffsetDateTime::now_utc());

        let rows = match self.ledger.list_linked_subscriptions().await {
            Ok(rows) => rows,
            Err(e) => {
                self.stats.write().await.failed_syncs += 1;
                tracing::error!(error = %e, "Full sync failed to list subscriptions");
                return Err(e);
            }
        };

        let mut summary = SyncRunSummary::default();
        for row in &rows {
            summary.checked += 1;
            if let Err(e) = self.sync_row(row, today, &mut summary).await {
                summary.failed += 1;
                tracing::error!(
                    subscription_id = ?row.square_subscription_id,
                    error = %e,
                    "Error syncing subscription"
                );
            }
        }

        {
            let mut stats = self.stats.write().await;
            stats.discrepancies_found += summary.discrepancies_found;
            stats.discrepancies_fixed += summary.discrepancies_fixed;
            stats.failed_syncs += summary.failed;
        }

        tracing::info!(
            checked = summary.checked,
            found = summary.discrepancies_found,
            fixed = summary.discrepancies_fixed,
            failed = summary.failed,
            "Full sync complete"
        );
        Ok(summary)
    }

    async fn sync_row(
        &self,
        row: &MembershipRecord,
        today: NaiveDate,
        summary: &mut SyncRunSummary,
    ) -> BillingResult<()> {
        let Some(sub_id) = row.square_subscription_id.as_deref() else {
            return Ok(());
        };

        let remote = match self.gateway.get_subscription(sub_id).await {
            Ok(remote) => remote,
            Err(RemoteError::NotFound(_)) => {
                tracing::warn!(subscription_id = %sub_id, "Subscription not found in Square");
                summary.skipped_missing += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(remote_status) = remote.status.as_deref() else {
            return Ok(());
        };

        let expected_status = expected_local_status(remote_status);
        if row.subscription_status.as_deref() != Some(remote_status)
            || row.status != expected_status
        {
            summary.discrepancies_found += 1;
            tracing::warn!(
                subscription_id = %sub_id,
                local_status = %row.status,
                local_remote_status = ?row.subscription_status,
                remote_status = %remote_status,
                "Status discrepancy"
            );
            self.ledger
                .overwrite_remote_status(sub_id, remote_status)
                .await?;
            summary.discrepancies_fixed += 1;
        }

        if remote_status == REMOTE_ACTIVE {
            let expected = self.expected_billing_date(&remote, today).await?;
            if row.next_billing_date != Some(expected) {
                summary.discrepancies_found += 1;
                tracing::warn!(
                    subscription_id = %sub_id,
                    local = ?row.next_billing_date,
                    expected = %expected,
                    "Billing date discrepancy"
                );
                self.ledger.set_next_billing_date(sub_id, expected).await?;
                summary.discrepancies_fixed += 1;
            }
        }

        Ok(())
    }

    async fn expected_billing_date(
        &self,
        remote: &RemoteSubscription,
        today: NaiveDate,
    ) -> BillingResult<NaiveDate> {
        let cadence = match remote.plan_variation_id.as_deref() {
            Some(variation) => {
                Cadence::parse(self.gateway.get_subscription_plan(variation).await?.cadence())
            }
            None => Cadence::Monthly,
        };
        Ok(next_billing_date(
            cadence,
            remote.monthly_billing_anchor_date,
            today,
        ))
    }

    /// Pull the billing date Square reports, or compute it from the cadence
    pub async fn sync_billing_date(&self, subscription_id: &str) -> BillingResult<NaiveDate> {
        let remote = self
            .gateway
            .get_subscription(subscription_id)
            .await
            .map_err(|e| match e {
                RemoteError::NotFound(_) => {
                    BillingError::NotFound(format!("Subscription {}", subscription_id))
                }
                other => other.into(),
            })?;

        let date = match remote.reported_billing_date() {
            Some(date) => date,
            None => {
                self.expected_billing_date(&remote, chrono::Utc::now().date_naive())
                    .await?
            }
        };

        self.ledger
            .set_next_billing_date(subscription_id, date)
            .await?;
        tracing::info!(subscription_id = %subscription_id, next_billing_date = %date, "Billing date synced");
        Ok(date)
    }

    pub async fn status(&self) -> BillingResult<SyncStatusReport> {
        let subscription_health = self.ledger.subscription_health().await?;
        let webhook_health = self.ledger.webhook_health().await?;
        let recommendation = if subscription_health.missing_billing_dates == 0
            && webhook_health.unprocessed_failures == 0
        {
            "healthy"
        } else {
            "needs_attention"
        };

        Ok(SyncStatusReport {
            sync_health: self.stats().await,
            subscription_health,
            webhook_health,
            recommendation,
        })
    }
}
