//! Mapping Square notifications back to local users
//!
//! Resolution is an ordered pipeline: order metadata, then the stored Square
//! customer id, then the Square customer's email (relinking the user on a
//! match). The first step that answers wins.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::client::PaymentGateway;
use crate::directory::{Directory, UserRecord};
use crate::error::{BillingResult, RemoteError};

/// What the checkout put in the order metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderContext {
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    /// Months a one-time purchase covers
    pub amt_periods: Option<u32>,
}

impl OrderContext {
    /// `None` unless the metadata names a valid user
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Option<Self> {
        let user_id = metadata
            .get("user_id")
            .or_else(|| metadata.get("customer_id"))
            .and_then(|v| Uuid::parse_str(v).ok())?;

        Some(Self {
            user_id,
            plan_id: metadata
                .get("membership_plan_id")
                .and_then(|v| Uuid::parse_str(v).ok()),
            event_id: metadata
                .get("event_id")
                .and_then(|v| Uuid::parse_str(v).ok()),
            amt_periods: metadata
                .get("amt_periods")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &u32| *n > 0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    ByMetadata(OrderContext),
    ByCustomerId(UserRecord),
    /// Matched on email; the user's stored customer id was rewritten
    ByEmailRelink(UserRecord),
    Unresolved,
}

impl Resolution {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Resolution::ByMetadata(ctx) => Some(ctx.user_id),
            Resolution::ByCustomerId(user) | Resolution::ByEmailRelink(user) => Some(user.id),
            Resolution::Unresolved => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Resolution::ByMetadata(_) => "metadata",
            Resolution::ByCustomerId(_) => "customer_id",
            Resolution::ByEmailRelink(_) => "email_relink",
            Resolution::Unresolved => "unresolved",
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    gateway: Arc<dyn PaymentGateway>,
    directory: Arc<dyn Directory>,
}

impl IdentityResolver {
    pub fn new(gateway: Arc<dyn PaymentGateway>, directory: Arc<dyn Directory>) -> Self {
        Self { gateway, directory }
    }

    /// Metadata first, then the customer id
    pub async fn resolve_payment(
        &self,
        metadata: Option<&HashMap<String, String>>,
        customer_id: Option<&str>,
    ) -> BillingResult<Resolution> {
        if let Some(ctx) = metadata.and_then(OrderContext::from_metadata) {
            return Ok(Resolution::ByMetadata(ctx));
        }
        match customer_id {
            Some(customer_id) => self.resolve_customer(customer_id).await,
            None => Ok(Resolution::Unresolved),
        }
    }

    pub async fn resolve_customer(&self, customer_id: &str) -> BillingResult<Resolution> {
        if let Some(user) = self.directory.get_user_by_customer_id(customer_id).await? {
            return Ok(Resolution::ByCustomerId(user));
        }

        let customer = match self.gateway.get_customer(customer_id).await {
            Ok(customer) => customer,
            Err(RemoteError::NotFound(_)) => {
                tracing::warn!(customer_id = %customer_id, "Square customer not found");
                return Ok(Resolution::Unresolved);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(email) = customer.email_address.filter(|e| !e.is_empty()) else {
            tracing::warn!(customer_id = %customer_id, "Square customer has no email");
            return Ok(Resolution::Unresolved);
        };

        let Some(mut user) = self.directory.get_user_by_email(&email).await? else {
            tracing::warn!(customer_id = %customer_id, "No local user for Square customer email");
            return Ok(Resolution::Unresolved);
        };

        self.directory
            .set_remote_customer_id(user.id, customer_id)
            .await?;
        tracing::info!(
            user_id = %user.id,
            customer_id = %customer_id,
            previous_customer_id = ?user.square_customer_id,
            "Relinked user to Square customer by email"
        );
        user.square_customer_id = Some(customer_id.to_string());

        Ok(Resolution::ByEmailRelink(user))
    }
}
