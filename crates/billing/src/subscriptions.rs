//! Subscription management
//!
//! User-initiated pause, resume, cancel and card changes on a Square
//! subscription the user owns, plus details and billing-date refresh.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::PaymentGateway;
use crate::error::{BillingError, BillingResult, RemoteError};
use crate::ledger::{Ledger, MembershipRecord};
use crate::models::{RemoteSubscription, SubscriptionEvent};
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageAction {
    Pause,
    Resume,
    Cancel,
    UpdateCard,
}

impl ManageAction {
    fn past_tense(&self) -> &'static str {
        match self {
            ManageAction::Pause => "paused",
            ManageAction::Resume => "resumed",
            ManageAction::Cancel => "canceled",
            ManageAction::UpdateCard => "updated",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManageSubscriptionRequest {
    pub action: ManageAction,
    #[serde(default)]
    pub card_id: Option<String>,
    /// Billing cycles to pause for; open-ended when absent
    #[serde(default)]
    pub pause_cycle_duration: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManageSubscriptionResponse {
    pub subscription_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDetails {
    pub subscription: RemoteSubscription,
    pub membership: Option<MembershipRecord>,
    pub events: Vec<SubscriptionEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingSyncResponse {
    pub subscription_id: String,
    pub next_billing_date: NaiveDate,
}

#[derive(Clone)]
pub struct SubscriptionService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    sync: SyncEngine,
}

impl SubscriptionService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: Arc<dyn Ledger>, sync: SyncEngine) -> Self {
        Self {
            gateway,
            ledger,
            sync,
        }
    }

    async fn ensure_owned(&self, user_id: Uuid, subscription_id: &str) -> BillingResult<()> {
        if self
            .ledger
            .owns_subscription(user_id, subscription_id)
            .await?
        {
            Ok(())
        } else {
            Err(BillingError::NotFound("Subscription not found".to_string()))
        }
    }

    pub async fn manage(
        &self,
        user_id: Uuid,
        subscription_id: &str,
        request: &ManageSubscriptionRequest,
    ) -> BillingResult<ManageSubscriptionResponse> {
        self.ensure_owned(user_id, subscription_id).await?;

        let remote = match request.action {
            ManageAction::Pause => {
                self.gateway
                    .pause_subscription(subscription_id, request.pause_cycle_duration)
                    .await
            }
            ManageAction::Resume => self.gateway.resume_subscription(subscription_id).await,
            ManageAction::Cancel => self.gateway.cancel_subscription(subscription_id).await,
            ManageAction::UpdateCard => {
                let card_id = request.card_id.as_deref().ok_or_else(|| {
                    BillingError::InvalidInput("card_id is required for update_card".to_string())
                })?;
                self.gateway
                    .update_subscription_card(subscription_id, card_id)
                    .await
            }
        }
        .map_err(|e| not_found_as_local(e, subscription_id))?;

        let status = remote
            .status
            .clone()
            .unwrap_or_else(|| "PENDING".to_string());
        self.ledger
            .overwrite_remote_status(subscription_id, &status)
            .await?;

        if request.action == ManageAction::UpdateCard {
            if let Some(card_id) = request.card_id.as_deref() {
                self.ledger
                    .record_auto_charging_success(subscription_id, card_id)
                    .await?;
            }
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            action = ?request.action,
            status = %status,
            "Subscription managed"
        );

        Ok(ManageSubscriptionResponse {
            subscription_id: subscription_id.to_string(),
            message: format!("Subscription {}", request.action.past_tense()),
            status,
        })
    }

    /// Remote subscription with its events; the row linked to it is refreshed first
    pub async fn details(
        &self,
        user_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionDetails> {
        self.ensure_owned(user_id, subscription_id).await?;

        let subscription = self
            .gateway
            .get_subscription(subscription_id)
            .await
            .map_err(|e| not_found_as_local(e, subscription_id))?;

        if let Some(status) = subscription.status.as_deref() {
            self.ledger
                .overwrite_remote_status(subscription_id, status)
                .await?;
        }
        if let Some(date) = subscription.reported_billing_date() {
            self.ledger
                .set_next_billing_date(subscription_id, date)
                .await?;
        }

        let events = match self.gateway.list_subscription_events(subscription_id).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not list subscription events"
                );
                Vec::new()
            }
        };

        Ok(SubscriptionDetails {
            membership: self
                .ledger
                .get_membership_by_subscription(subscription_id)
                .await?,
            subscription,
            events,
        })
    }

    pub async fn sync_billing(
        &self,
        user_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<BillingSyncResponse> {
        self.ensure_owned(user_id, subscription_id).await?;
        let next_billing_date = self.sync.sync_billing_date(subscription_id).await?;
        Ok(BillingSyncResponse {
            subscription_id: subscription_id.to_string(),
            next_billing_date,
        })
    }

    /// Deactivate one-time memberships whose renewal date passed
    pub async fn expire_memberships(&self) -> BillingResult<u64> {
        let expired = self.ledger.expire_lapsed_memberships().await?;
        tracing::info!(expired = expired, "Membership expiry sweep complete");
        Ok(expired)
    }
}

fn not_found_as_local(e: RemoteError, subscription_id: &str) -> BillingError {
    match e {
        RemoteError::NotFound(_) => {
            BillingError::NotFound(format!("Subscription {}", subscription_id))
        }
        other => other.into(),
    }
}
