//! Automatic charging for subscriptions created from a checkout payment
//!
//! A subscription created after the first payment has no card on file. The
//! card used for that payment is attached so later invoices charge it; setups
//! that fail are retried by the worker and eventually marked permanent.

use std::sync::Arc;

use serde::Serialize;

use crate::client::PaymentGateway;
use crate::error::BillingResult;
use crate::ledger::{AutoChargingCounts, Ledger};

pub const MAX_RETRIES: i32 = 3;
pub const RETRY_WINDOW_HOURS: i32 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoChargingOutcome {
    Enabled { card_id: String },
    Failed { error_type: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoChargingRetrySummary {
    pub candidates: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub permanently_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoChargingReport {
    #[serde(flatten)]
    pub counts: AutoChargingCounts,
    /// Percentage of active subscriptions with a card attached
    pub success_rate: f64,
}

impl AutoChargingReport {
    pub fn from_counts(counts: AutoChargingCounts) -> Self {
        let success_rate = if counts.total_active_subscriptions > 0 {
            (counts.enabled as f64 / counts.total_active_subscriptions as f64 * 1000.0).round()
                / 10.0
        } else {
            0.0
        };
        Self {
            counts,
            success_rate,
        }
    }
}

#[derive(Clone)]
pub struct AutoChargingService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
}

impl AutoChargingService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: Arc<dyn Ledger>) -> Self {
        Self { gateway, ledger }
    }

    /// Attach the card that paid `payment_id` to the subscription.
    ///
    /// Never fails the caller: problems are recorded against the subscription
    /// for the retry job.
    pub async fn enable_for_payment(
        &self,
        subscription_id: &str,
        payment_id: &str,
        card_hint: Option<&str>,
    ) -> AutoChargingOutcome {
        let card_id = match card_hint {
            Some(card) => Some(card.to_string()),
            None => match self.gateway.get_payment(payment_id).await {
                Ok(payment) => payment.card_id().map(str::to_string),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        payment_id = %payment_id,
                        error = %e,
                        "Could not load payment for auto-charging"
                    );
                    None
                }
            },
        };

        let Some(card_id) = card_id else {
            self.record_failure(
                subscription_id,
                None,
                "no_card_on_payment",
                &format!("payment {} has no card", payment_id),
            )
            .await;
            return AutoChargingOutcome::Failed {
                error_type: "no_card_on_payment",
            };
        };

        self.attach_card(subscription_id, &card_id).await
    }

    async fn attach_card(&self, subscription_id: &str, card_id: &str) -> AutoChargingOutcome {
        match self
            .gateway
            .update_subscription_card(subscription_id, card_id)
            .await
        {
            Ok(_) => {
                if let Err(e) = self
                    .ledger
                    .record_auto_charging_success(subscription_id, card_id)
                    .await
                {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to record auto-charging setup"
                    );
                }
                tracing::info!(subscription_id = %subscription_id, "Auto-charging enabled");
                AutoChargingOutcome::Enabled {
                    card_id: card_id.to_string(),
                }
            }
            Err(e) => {
                self.record_failure(
                    subscription_id,
                    Some(card_id),
                    "card_update_failed",
                    &e.to_string(),
                )
                .await;
                AutoChargingOutcome::Failed {
                    error_type: "card_update_failed",
                }
            }
        }
    }

    async fn record_failure(
        &self,
        subscription_id: &str,
        card_id: Option<&str>,
        error_type: &str,
        details: &str,
    ) {
        tracing::warn!(
            subscription_id = %subscription_id,
            error_type = error_type,
            details = %details,
            "Auto-charging setup failed"
        );
        if let Err(e) = self
            .ledger
            .record_auto_charging_failure(subscription_id, card_id, error_type, details)
            .await
        {
            tracing::error!(
                subscription_id = %subscription_id,
                error = %e,
                "Failed to record auto-charging failure"
            );
        }
    }

    /// Retry recent failed setups; the third failed retry is permanent
    pub async fn retry_failed(&self) -> BillingResult<AutoChargingRetrySummary> {
        let candidates = self
            .ledger
            .auto_charging_retry_candidates(MAX_RETRIES, RETRY_WINDOW_HOURS)
            .await?;

        let mut summary = AutoChargingRetrySummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let sub_id = candidate.square_subscription_id.as_str();
            let outcome = match candidate.card_id.as_deref() {
                Some(card) => self.attach_card(sub_id, card).await,
                None => AutoChargingOutcome::Failed {
                    error_type: "no_card_on_payment",
                },
            };

            if matches!(outcome, AutoChargingOutcome::Enabled { .. }) {
                summary.recovered += 1;
                continue;
            }

            self.ledger.increment_auto_charging_retry(sub_id).await?;
            if candidate.retry_count + 1 >= MAX_RETRIES {
                self.ledger
                    .mark_auto_charging_permanently_failed(sub_id)
                    .await?;
                tracing::warn!(
                    subscription_id = %sub_id,
                    customer_id = %candidate.customer_id,
                    "Auto-charging permanently failed"
                );
                summary.permanently_failed += 1;
            } else {
                summary.still_failing += 1;
            }
        }

        tracing::info!(
            candidates = summary.candidates,
            recovered = summary.recovered,
            permanently_failed = summary.permanently_failed,
            "Auto-charging retry complete"
        );
        Ok(summary)
    }

    pub async fn status_report(&self) -> BillingResult<AutoChargingReport> {
        let counts = self.ledger.auto_charging_counts().await?;
        Ok(AutoChargingReport::from_counts(counts))
    }
}
