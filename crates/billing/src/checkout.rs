//! Checkout sessions for memberships and events
//!
//! Checkout only creates a Square payment link. Memberships are activated and
//! subscriptions created when the payment webhook arrives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{AdHocLineItem, CheckoutLineItem, NewPaymentLink, PaymentGateway};
use crate::config::SquareConfig;
use crate::directory::Directory;
use crate::error::{BillingError, BillingResult, RemoteError};
use crate::guard::{keys, DuplicateGuard};
use crate::ledger::Ledger;

pub const CHECKOUT_PENDING: &str = "CHECKOUT_PENDING";

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionCheckoutRequest {
    pub membership_plan_id: Uuid,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionCheckoutResponse {
    pub subscription_id: String,
    pub status: String,
    pub message: String,
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventCheckoutRequest {
    pub event_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventCheckoutResponse {
    /// `None` when nothing is owed
    pub checkout_url: Option<String>,
    pub payment_status: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    directory: Arc<dyn Directory>,
    guard: DuplicateGuard,
    location_id: String,
    currency: String,
    frontend_url: String,
}

impl CheckoutService {
    pub fn new(
        config: &SquareConfig,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        directory: Arc<dyn Directory>,
        guard: DuplicateGuard,
    ) -> Self {
        Self {
            gateway,
            ledger,
            directory,
            guard,
            location_id: config.location_id.clone(),
            currency: config.currency.clone(),
            frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
        }
    }

    /// Start a membership subscription checkout
    pub async fn create_subscription_checkout(
        &self,
        user_id: Uuid,
        request: &SubscriptionCheckoutRequest,
    ) -> BillingResult<SubscriptionCheckoutResponse> {
        let plan_id = request.membership_plan_id;

        if self
            .guard
            .is_duplicate_checkout_request(user_id, plan_id)
            .await
        {
            return Err(BillingError::DuplicateRequest(
                "Checkout already in progress, please wait".to_string(),
            ));
        }

        if self
            .guard
            .has_existing_active_subscription(user_id, plan_id)
            .await?
        {
            return Err(BillingError::Conflict(
                "You already have an active subscription for this plan".to_string(),
            ));
        }

        let plan = self
            .directory
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Membership plan not found".to_string()))?;
        if plan.remote_variation_id.is_none() {
            return Err(BillingError::InvalidInput(
                "Membership plan is not available as a subscription".to_string(),
            ));
        }

        let user = self
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("User not found".to_string()))?;

        let amount = plan.price_cents.unwrap_or(0);
        if self
            .guard
            .recent_identical_payment(user_id, plan_id, amount)
            .await?
        {
            return Err(BillingError::Conflict(
                "A payment for this plan was completed in the last 10 minutes".to_string(),
            ));
        }

        self.ledger
            .upsert_checkout_placeholder(user_id, plan_id)
            .await?;

        let link = self
            .gateway
            .create_checkout_session(&NewPaymentLink {
                idempotency_key: keys::checkout(user_id, plan_id),
                location_id: self.location_id.clone(),
                line_items: vec![CheckoutLineItem::AdHoc(AdHocLineItem {
                    name: format!("Subscription: {}", plan.name),
                    amount,
                    currency: self.currency.clone(),
                })],
                metadata: vec![
                    ("user_id".to_string(), user_id.to_string()),
                    ("membership_plan_id".to_string(), plan_id.to_string()),
                ],
                redirect_url: Some(format!("{}/membership/success", self.frontend_url)),
                buyer_email: Some(user.email.clone()),
            })
            .await
            .map_err(checkout_error)?;

        let checkout_id = link.order_id.clone().unwrap_or_else(|| link.id.clone());
        self.ledger
            .record_payment_attempt(user_id, plan_id, amount, &checkout_id)
            .await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            link_id = %link.id,
            timezone = ?request.timezone,
            "Subscription checkout created"
        );

        Ok(SubscriptionCheckoutResponse {
            subscription_id: link.id,
            status: CHECKOUT_PENDING.to_string(),
            message: "Complete payment to activate your membership".to_string(),
            checkout_url: link.url,
        })
    }

    /// Start an event checkout, or enroll directly when nothing is owed
    pub async fn create_event_checkout(
        &self,
        user_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<EventCheckoutResponse> {
        let event = self
            .directory
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Event not found".to_string()))?;
        let user = self
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("User not found".to_string()))?;

        if let Some(required_plan) = event.required_plan_id {
            if self
                .ledger
                .has_covering_membership(user_id, required_plan)
                .await?
            {
                self.ledger.mark_enrollment_paid(user_id, event_id).await?;
                tracing::info!(
                    user_id = %user_id,
                    event_id = %event_id,
                    "Event covered by membership"
                );
                return Ok(paid());
            }
            if event.price_ref.is_none() {
                return Err(BillingError::Forbidden(
                    "This event requires an active membership".to_string(),
                ));
            }
        }

        let Some(price_ref) = event.price_ref.clone() else {
            self.ledger.mark_enrollment_paid(user_id, event_id).await?;
            tracing::info!(user_id = %user_id, event_id = %event_id, "Free event enrollment");
            return Ok(paid());
        };

        self.ledger
            .upsert_pending_enrollment(user_id, event_id)
            .await?;

        let link = self
            .gateway
            .create_checkout_session(&NewPaymentLink {
                idempotency_key: keys::event(user_id, event_id),
                location_id: self.location_id.clone(),
                line_items: vec![CheckoutLineItem::Catalog {
                    variation_id: price_ref,
                }],
                metadata: vec![
                    ("user_id".to_string(), user_id.to_string()),
                    ("event_id".to_string(), event_id.to_string()),
                ],
                redirect_url: Some(format!("{}/events/{}", self.frontend_url, event_id)),
                buyer_email: Some(user.email),
            })
            .await
            .map_err(checkout_error)?;

        tracing::info!(
            user_id = %user_id,
            event_id = %event_id,
            link_id = %link.id,
            "Event checkout created"
        );

        Ok(EventCheckoutResponse {
            checkout_url: link.url,
            payment_status: "pending".to_string(),
        })
    }
}

fn paid() -> EventCheckoutResponse {
    EventCheckoutResponse {
        checkout_url: None,
        payment_status: "paid".to_string(),
    }
}

fn checkout_error(e: RemoteError) -> BillingError {
    if e.is_idempotency_reuse() {
        BillingError::Conflict("This checkout was already submitted with different details".into())
    } else {
        BillingError::Remote(e)
    }
}
