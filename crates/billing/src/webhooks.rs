//! Square webhook handling
//!
//! Verified notifications are parsed into [`WebhookEvent`], resolved to local
//! users and applied to the ledger. Processing errors never reach Square: the
//! raw event is stored and the delivery acknowledged so it can be replayed.

use std::sync::Arc;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auto_charging::AutoChargingService;
use crate::billing_date::{next_billing_date, Cadence};
use crate::client::{AdHocLineItem, NewCustomer, NewDraftOrder, NewSubscription, PaymentGateway};
use crate::config::SquareConfig;
use crate::directory::Directory;
use crate::error::{BillingError, BillingResult};
use crate::events::{InvoiceNotice, PaymentNotice, SubscriptionNotice, WebhookEvent};
use crate::guard::{keys, DuplicateGuard};
use crate::identity::{IdentityResolver, OrderContext, Resolution};
use crate::ledger::{Ledger, SubscriptionLink, SOURCE_ONE_TIME, SOURCE_SUBSCRIPTION};
use crate::models::RemoteSubscription;
use crate::signature::SignatureVerifier;

const REPLAY_BATCH_SIZE: i64 = 10;

/// Body returned to Square for every accepted delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAck {
    Ok,
    Ignored,
    ErrorStoredForRetry,
    DuplicateIgnored,
}

impl WebhookAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookAck::Ok => "ok",
            WebhookAck::Ignored => "ignored",
            WebhookAck::ErrorStoredForRetry => "error_stored_for_retry",
            WebhookAck::DuplicateIgnored => "duplicate_ignored",
        }
    }
}

/// Replays skip the in-process payment cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Live,
    Replay,
}

/// Webhook handler for Square events
#[derive(Clone)]
pub struct WebhookHandler {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    directory: Arc<dyn Directory>,
    guard: DuplicateGuard,
    verifier: SignatureVerifier,
    resolver: IdentityResolver,
    auto_charging: AutoChargingService,
    location_id: String,
    currency: String,
    delinquency_events: Vec<String>,
}

impl WebhookHandler {
    pub fn new(
        config: &SquareConfig,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        directory: Arc<dyn Directory>,
        guard: DuplicateGuard,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(
                config.webhook_signature_key.clone(),
                config.webhook_url.clone(),
            ),
            resolver: IdentityResolver::new(gateway.clone(), directory.clone()),
            auto_charging: AutoChargingService::new(gateway.clone(), ledger.clone()),
            gateway,
            ledger,
            directory,
            guard,
            location_id: config.location_id.clone(),
            currency: config.currency.clone(),
            delinquency_events: config.delinquency_events.clone(),
        }
    }

    /// Verify, parse and process one delivery.
    ///
    /// Only a bad signature or an unparseable body is an error; everything
    /// after that is acknowledged.
    pub async fn handle(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> BillingResult<WebhookAck> {
        if !self.verifier.verify(signature_header, body) {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

        Ok(self.process(&event, DeliveryMode::Live).await)
    }

    /// Dispatch and absorb failures into the failure store
    pub async fn process(&self, event: &Value, mode: DeliveryMode) -> WebhookAck {
        match self.dispatch(event, mode).await {
            Ok(ack) => ack,
            Err(e) => {
                let event_type = event.get("type").and_then(Value::as_str);
                tracing::error!(
                    event_type = ?event_type,
                    error = %e,
                    "Webhook processing failed, storing for retry"
                );
                if let Err(store_err) = self
                    .ledger
                    .store_failure(event_type, event, &e.to_string())
                    .await
                {
                    tracing::error!(error = %store_err, "Could not store failed webhook");
                }
                WebhookAck::ErrorStoredForRetry
            }
        }
    }

    pub async fn dispatch(&self, event: &Value, mode: DeliveryMode) -> BillingResult<WebhookAck> {
        let parsed = WebhookEvent::parse(event, &self.delinquency_events);
        let event_id = event.get("event_id").and_then(Value::as_str);
        tracing::info!(
            event_type = parsed.event_type(),
            event_id = ?event_id,
            "Processing Square webhook"
        );

        match parsed {
            WebhookEvent::PaymentUpdated(payment) => self.handle_payment(&payment, mode).await,
            WebhookEvent::SubscriptionCreated(sub) => self.handle_subscription_created(&sub).await,
            WebhookEvent::SubscriptionUpdated(sub) => self.handle_subscription_updated(&sub).await,
            WebhookEvent::InvoicePaymentMade(invoice) => self.handle_invoice_paid(&invoice).await,
            WebhookEvent::InvoiceChargeFailed(invoice) => {
                self.handle_invoice_charge_failed(&invoice).await
            }
            WebhookEvent::InvoiceOther { event_type } => {
                tracing::debug!(event_type = %event_type, "Invoice event needs no action");
                Ok(WebhookAck::Ignored)
            }
            WebhookEvent::Malformed { event_type, reason } => {
                tracing::warn!(event_type = %event_type, reason = %reason, "Malformed webhook");
                Ok(WebhookAck::Ignored)
            }
            WebhookEvent::Unknown { event_type } => {
                tracing::info!(event_type = %event_type, "Unhandled webhook event type");
                Ok(WebhookAck::Ignored)
            }
        }
    }

    // ============ PAYMENTS ============

    async fn handle_payment(
        &self,
        payment: &PaymentNotice,
        mode: DeliveryMode,
    ) -> BillingResult<WebhookAck> {
        if mode == DeliveryMode::Live && self.guard.is_duplicate_payment_webhook(&payment.id).await
        {
            tracing::warn!(payment_id = %payment.id, "Duplicate payment webhook ignored");
            return Ok(WebhookAck::DuplicateIgnored);
        }

        tracing::info!(
            payment_id = %payment.id,
            status = ?payment.status,
            order_id = ?payment.order_id,
            amount = ?payment.amount(),
            "payment.updated"
        );

        let ack = if payment.is_completed() {
            self.process_completed_payment(payment).await?
        } else if payment.is_failed() {
            self.process_failed_payment(payment).await?
        } else {
            WebhookAck::Ok
        };

        if payment.is_completed() {
            self.guard.mark_payment_processed(&payment.id).await;
        }
        Ok(ack)
    }

    async fn resolve_payment(&self, payment: &PaymentNotice) -> BillingResult<Resolution> {
        let order = match &payment.order_id {
            Some(order_id) => Some(self.gateway.get_order(order_id).await?),
            None => None,
        };

        let metadata = order.as_ref().and_then(|o| o.effective_metadata());
        if let Some((_, source)) = &metadata {
            tracing::debug!(payment_id = %payment.id, source = ?source, "Order metadata found");
        }

        let customer_id = payment
            .customer_id
            .as_deref()
            .or_else(|| order.as_ref().and_then(|o| o.customer_id.as_deref()));

        let resolution = self
            .resolver
            .resolve_payment(metadata.map(|(m, _)| m), customer_id)
            .await?;
        tracing::info!(
            payment_id = %payment.id,
            method = resolution.method(),
            user_id = ?resolution.user_id(),
            "Payment identity resolved"
        );
        Ok(resolution)
    }

    async fn process_completed_payment(&self, payment: &PaymentNotice) -> BillingResult<WebhookAck> {
        match self.resolve_payment(payment).await? {
            Resolution::ByMetadata(ctx) => {
                if !self.metadata_targets_exist(&ctx, payment).await? {
                    return Ok(WebhookAck::Ignored);
                }
                let mut handled = false;
                if let Some(event_id) = ctx.event_id {
                    self.ledger.mark_enrollment_paid(ctx.user_id, event_id).await?;
                    tracing::info!(
                        user_id = %ctx.user_id,
                        event_id = %event_id,
                        "Event enrollment paid"
                    );
                    handled = true;
                }
                if let Some(plan_id) = ctx.plan_id {
                    self.activate_membership(ctx.user_id, plan_id, payment, ctx.amt_periods)
                        .await?;
                    self.ledger
                        .resolve_pending_attempts(ctx.user_id, plan_id, "completed")
                        .await?;
                    handled = true;
                }
                Ok(if handled {
                    WebhookAck::Ok
                } else {
                    WebhookAck::Ignored
                })
            }
            Resolution::ByCustomerId(user) | Resolution::ByEmailRelink(user) => {
                let Some(plan_id) = self.ledger.pending_subscription_plan(user.id).await? else {
                    tracing::warn!(
                        user_id = %user.id,
                        payment_id = %payment.id,
                        "No pending subscription for paying customer"
                    );
                    return Ok(WebhookAck::Ignored);
                };
                self.activate_membership(user.id, plan_id, payment, None)
                    .await?;
                self.ledger
                    .resolve_pending_attempts(user.id, plan_id, "completed")
                    .await?;
                Ok(WebhookAck::Ok)
            }
            Resolution::Unresolved => {
                tracing::warn!(payment_id = %payment.id, "Could not resolve payment to a user");
                Ok(WebhookAck::Ignored)
            }
        }
    }

    /// Metadata names local rows by id; a user or plan the directory does not
    /// know is an identity miss, not a processing error
    async fn metadata_targets_exist(
        &self,
        ctx: &OrderContext,
        payment: &PaymentNotice,
    ) -> BillingResult<bool> {
        if self.directory.get_user(ctx.user_id).await?.is_none() {
            tracing::warn!(
                payment_id = %payment.id,
                user_id = %ctx.user_id,
                "Order metadata names an unknown user"
            );
            return Ok(false);
        }
        if let Some(plan_id) = ctx.plan_id {
            if self.directory.get_plan(plan_id).await?.is_none() {
                tracing::warn!(
                    payment_id = %payment.id,
                    plan_id = %plan_id,
                    "Order metadata names an unknown membership plan"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn process_failed_payment(&self, payment: &PaymentNotice) -> BillingResult<WebhookAck> {
        let (user_id, plan_id) = match self.resolve_payment(payment).await? {
            Resolution::ByMetadata(ctx) => (ctx.user_id, ctx.plan_id),
            Resolution::ByCustomerId(user) | Resolution::ByEmailRelink(user) => (user.id, None),
            Resolution::Unresolved => return Ok(WebhookAck::Ignored),
        };

        let deactivated = self
            .ledger
            .deactivate_subscription_rows(user_id, plan_id)
            .await?;
        if let Some(plan_id) = plan_id {
            self.ledger
                .resolve_pending_attempts(user_id, plan_id, "failed")
                .await?;
        }

        tracing::warn!(
            user_id = %user_id,
            payment_id = %payment.id,
            status = ?payment.status,
            deactivated = deactivated,
            "Payment failed"
        );
        Ok(if deactivated > 0 {
            WebhookAck::Ok
        } else {
            WebhookAck::Ignored
        })
    }

    /// Activate the membership once. Only the caller whose conditional write
    /// changed the row goes on to create the Square subscription.
    async fn activate_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        payment: &PaymentNotice,
        amt_periods: Option<u32>,
    ) -> BillingResult<()> {
        if self.ledger.activate_if_inactive(user_id, plan_id).await? {
            tracing::info!(user_id = %user_id, plan_id = %plan_id, "Membership activated");
            let needs_subscription = self
                .ledger
                .get_membership(user_id, plan_id)
                .await?
                .is_some_and(|row| {
                    row.square_subscription_id.is_none()
                        && row.subscription_source == SOURCE_SUBSCRIPTION
                });
            if needs_subscription {
                self.provision_subscription(user_id, plan_id, payment).await?;
            }
            return Ok(());
        }

        if self.ledger.get_membership(user_id, plan_id).await?.is_some() {
            tracing::info!(user_id = %user_id, plan_id = %plan_id, "Membership already active");
            return Ok(());
        }

        let (source, renewal_date) = match amt_periods {
            Some(months) => (SOURCE_ONE_TIME, Some(renewal_after(chrono::Utc::now(), months))),
            None => (SOURCE_SUBSCRIPTION, None),
        };
        let inserted = self
            .ledger
            .insert_active_membership(user_id, plan_id, source, renewal_date)
            .await?;
        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            source = source,
            inserted = inserted,
            "Membership created from payment"
        );

        if inserted && source == SOURCE_SUBSCRIPTION {
            self.provision_subscription(user_id, plan_id, payment).await?;
        }
        Ok(())
    }

    async fn provision_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        payment: &PaymentNotice,
    ) -> BillingResult<()> {
        match self.create_remote_subscription(user_id, plan_id).await {
            Ok(link) => {
                self.ledger
                    .attach_remote_subscription(user_id, plan_id, &link)
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %link.subscription_id,
                    status = %link.remote_status,
                    next_billing_date = ?link.next_billing_date,
                    "Square subscription linked"
                );
                self.auto_charging
                    .enable_for_payment(&link.subscription_id, &payment.id, payment.card_id())
                    .await;
                Ok(())
            }
            Err(e) => {
                // Row must be inactive again for a replay to re-run provisioning
                self.ledger.revert_activation(user_id, plan_id).await?;
                Err(e)
            }
        }
    }

    async fn create_remote_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<SubscriptionLink> {
        let user = self
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;

        let customer_id = match user.square_customer_id.clone() {
            Some(id) => id,
            None => {
                let customer = self
                    .gateway
                    .create_customer(&NewCustomer {
                        idempotency_key: keys::customer(user_id),
                        email: user.email.clone(),
                        given_name: user.first_name.clone(),
                        family_name: user.last_name.clone(),
                        reference_id: Some(user_id.to_string()),
                    })
                    .await?;
                self.directory
                    .set_remote_customer_id(user_id, &customer.id)
                    .await?;
                tracing::info!(user_id = %user_id, customer_id = %customer.id, "Square customer created");
                customer.id
            }
        };

        let plan = self
            .directory
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Membership plan {}", plan_id)))?;
        let variation_id = plan.remote_variation_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!("Plan {} has no Square variation", plan_id))
        })?;

        let catalog = self.gateway.get_subscription_plan(&variation_id).await?;
        let order_template_id = if catalog.has_relative_pricing() {
            let order = self
                .gateway
                .create_order(&NewDraftOrder {
                    idempotency_key: keys::order_template(user_id, plan_id),
                    location_id: self.location_id.clone(),
                    line_item: AdHocLineItem {
                        name: plan.name.clone(),
                        amount: plan.price_cents.unwrap_or(0),
                        currency: self.currency.clone(),
                    },
                })
                .await?;
            tracing::info!(order_template_id = %order.id, "Order template created");
            Some(order.id)
        } else {
            None
        };

        let created = self
            .gateway
            .create_subscription(&NewSubscription {
                idempotency_key: keys::subscription(user_id, plan_id),
                location_id: self.location_id.clone(),
                plan_variation_id: variation_id,
                customer_id,
                order_template_id,
                card_id: None,
            })
            .await?;

        let details = match self.gateway.get_subscription(&created.id).await {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %created.id,
                    error = %e,
                    "Using create response for subscription details"
                );
                created
            }
        };

        Ok(SubscriptionLink {
            remote_status: details.status.clone().unwrap_or_else(|| "PENDING".to_string()),
            created_at: details.created_at(),
            next_billing_date: details.reported_billing_date(),
            subscription_id: details.id,
        })
    }

    // ============ SUBSCRIPTIONS ============

    async fn handle_subscription_created(
        &self,
        sub: &SubscriptionNotice,
    ) -> BillingResult<WebhookAck> {
        let Some(customer_id) = sub.customer_id.as_deref() else {
            tracing::warn!(subscription_id = %sub.id, "subscription.created without customer");
            return Ok(WebhookAck::Ignored);
        };

        let resolution = self.resolver.resolve_customer(customer_id).await?;
        let Some(user_id) = resolution.user_id() else {
            tracing::warn!(
                subscription_id = %sub.id,
                customer_id = %customer_id,
                "No user for Square customer"
            );
            return Ok(WebhookAck::Ignored);
        };

        let details = self.gateway.get_subscription(&sub.id).await?;
        let plan_id = match sub
            .plan_variation_id
            .as_deref()
            .or(details.plan_variation_id.as_deref())
        {
            Some(variation) => self
                .directory
                .get_plan_by_variation(variation)
                .await?
                .map(|plan| plan.id),
            None => None,
        };
        let link = SubscriptionLink {
            subscription_id: sub.id.clone(),
            remote_status: details
                .status
                .clone()
                .or_else(|| sub.status.clone())
                .unwrap_or_else(|| "PENDING".to_string()),
            created_at: details.created_at(),
            next_billing_date: Some(self.billing_date_for(&details, today()).await),
        };

        let updated = self
            .ledger
            .backfill_created_subscription(user_id, plan_id, &link)
            .await?;
        if updated == 0 {
            tracing::warn!(
                user_id = %user_id,
                subscription_id = %sub.id,
                plan_id = ?plan_id,
                "No membership row to attach subscription to"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %sub.id,
                status = %link.remote_status,
                method = resolution.method(),
                "Subscription backfilled"
            );
        }
        Ok(WebhookAck::Ok)
    }

    async fn handle_subscription_updated(
        &self,
        sub: &SubscriptionNotice,
    ) -> BillingResult<WebhookAck> {
        let Some(status) = sub.status.as_deref() else {
            return Ok(WebhookAck::Ignored);
        };

        let updated = self
            .ledger
            .update_status_by_subscription(&sub.id, status)
            .await?;
        if updated == 0 {
            tracing::warn!(subscription_id = %sub.id, "No membership for subscription");
        } else {
            tracing::info!(subscription_id = %sub.id, status = %status, "Subscription status updated");
        }
        Ok(WebhookAck::Ok)
    }

    // ============ INVOICES ============

    async fn handle_invoice_paid(&self, invoice: &InvoiceNotice) -> BillingResult<WebhookAck> {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            return Ok(WebhookAck::Ignored);
        };

        let next = self.remote_billing_date(subscription_id).await;
        let updated = self
            .ledger
            .mark_paid_by_subscription(subscription_id, next)
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            invoice_id = ?invoice.id,
            next_billing_date = ?next,
            updated = updated,
            "Invoice paid"
        );
        Ok(WebhookAck::Ok)
    }

    /// Billing date for a subscription as Square currently reports it;
    /// `None` if Square cannot be asked
    async fn remote_billing_date(&self, subscription_id: &str) -> Option<NaiveDate> {
        match self.gateway.get_subscription(subscription_id).await {
            Ok(sub) => Some(self.billing_date_for(&sub, today()).await),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not read billing date"
                );
                None
            }
        }
    }

    /// The date Square reports, else the next date for the plan cadence.
    /// A plan lookup failure falls back to monthly.
    async fn billing_date_for(&self, sub: &RemoteSubscription, from: NaiveDate) -> NaiveDate {
        if let Some(date) = sub.reported_billing_date() {
            return date;
        }

        let cadence = match sub.plan_variation_id.as_deref() {
            Some(variation) => match self.gateway.get_subscription_plan(variation).await {
                Ok(plan) => Cadence::parse(plan.cadence()),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not get plan cadence, using monthly");
                    Cadence::Monthly
                }
            },
            None => Cadence::Monthly,
        };

        next_billing_date(cadence, sub.monthly_billing_anchor_date, from)
    }

    async fn handle_invoice_charge_failed(
        &self,
        invoice: &InvoiceNotice,
    ) -> BillingResult<WebhookAck> {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            return Ok(WebhookAck::Ignored);
        };

        let updated = self.ledger.mark_delinquent(subscription_id).await?;
        tracing::warn!(
            subscription_id = %subscription_id,
            updated = updated,
            "Subscription marked delinquent"
        );
        Ok(WebhookAck::Ok)
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// Replay up to 10 stored failures from the last 24 hours, oldest first.
    /// Successful replays are marked processed; failures stay queued.
    pub async fn replay_failed(&self) -> BillingResult<WebhookReplaySummary> {
        let failures = self.ledger.fetch_unprocessed(REPLAY_BATCH_SIZE).await?;
        let mut summary = WebhookReplaySummary {
            attempted: failures.len(),
            ..Default::default()
        };

        for failure in failures {
            match self.dispatch(&failure.event_data, DeliveryMode::Replay).await {
                Ok(ack) => {
                    self.ledger.mark_processed(failure.id).await?;
                    tracing::info!(
                        failure_id = %failure.id,
                        event_type = ?failure.event_type,
                        result = ack.as_str(),
                        "Replayed failed webhook"
                    );
                    summary.succeeded += 1;
                }
                Err(e) => {
                    tracing::error!(
                        failure_id = %failure.id,
                        event_type = ?failure.event_type,
                        error = %e,
                        "Webhook replay failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            "Webhook replay complete"
        );
        Ok(summary)
    }
}

/// Result of a webhook replay batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookReplaySummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Renewal timestamp `months` calendar months after `from`, clamped to the
/// target month's last day
fn renewal_after(from: DateTime<Utc>, months: u32) -> OffsetDateTime {
    let renewal = from.checked_add_months(Months::new(months)).unwrap_or(from);
    OffsetDateTime::from_unix_timestamp(renewal.timestamp())
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}
