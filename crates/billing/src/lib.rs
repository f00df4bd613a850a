// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Square requests carry many parameters
#![allow(clippy::type_complexity)] // Metadata lookups return tuples
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rise Billing Module
//!
//! Keeps local memberships consistent with Square subscriptions.
//!
//! ## Features
//!
//! - **Webhooks**: Verify, classify and apply Square notifications, storing failures for replay
//! - **Checkout**: Payment links for memberships and events, with duplicate prevention
//! - **Identity Resolution**: Map payments and customers back to local users
//! - **Subscription Management**: Pause, resume, cancel and card changes
//! - **Auto-Charging**: Attach the paying card to subscriptions created from checkout
//! - **Full Sync**: Periodic repair of local drift against Square

pub mod auto_charging;
pub mod billing_date;
pub mod checkout;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod guard;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod retry;
pub mod signature;
pub mod subscriptions;
pub mod sync;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod test_support;


// Auto-Charging
pub use auto_charging::{
    AutoChargingOutcome, AutoChargingReport, AutoChargingRetrySummary, AutoChargingService,
};

// Billing Dates
pub use billing_date::{next_billing_date, Cadence};

// Checkout
pub use checkout::{
    CheckoutService, EventCheckoutRequest, EventCheckoutResponse, SubscriptionCheckoutRequest,
    SubscriptionCheckoutResponse,
};

// Client
pub use client::{PaymentGateway, SquareClient};
pub use config::{SquareConfig, SquareEnvironment};

// Directory
pub use directory::{Directory, EventRecord, PgDirectory, PlanRecord, UserRecord};

// Error
pub use error::{BillingError, BillingResult, RemoteError};

// Events
pub use events::WebhookEvent;

// Duplicate Guard
pub use guard::{CleanupStats, DuplicateCache, DuplicateGuard, InMemoryCache};

// Identity
pub use identity::{IdentityResolver, OrderContext, Resolution};

// Ledger
pub use ledger::{Ledger, MembershipRecord, PgLedger};

// Models
pub use models::PlanSummary;

// Retry
pub use retry::RetryPolicy;

// Signature
pub use signature::{SignatureVerifier, SIGNATURE_HEADER};

// Subscriptions
pub use subscriptions::{
    BillingSyncResponse, ManageAction, ManageSubscriptionRequest, ManageSubscriptionResponse,
    SubscriptionDetails, SubscriptionService,
};

// Sync
pub use sync::{SyncEngine, SyncRunSummary, SyncStats, SyncStatusReport};

// Webhooks
pub use webhooks::{DeliveryMode, WebhookAck, WebhookHandler, WebhookReplaySummary};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub auto_charging: AutoChargingService,
    pub checkout: CheckoutService,
    pub gateway: Arc<dyn PaymentGateway>,
    pub guard: DuplicateGuard,
    pub ledger: Arc<dyn Ledger>,
    /// `Square-Version` header sent on every request
    pub square_version: String,
    pub subscriptions: SubscriptionService,
    pub sync: SyncEngine,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(SquareConfig::from_env()?, pool)
    }

    /// Create a new billing service with explicit config
    pub fn new(config: SquareConfig, pool: PgPool) -> BillingResult<Self> {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(SquareClient::new(config.clone())?);
        let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(pool.clone()));
        let directory: Arc<dyn Directory> = Arc::new(PgDirectory::new(pool));
        Ok(Self::with_parts(&config, gateway, ledger, directory))
    }

    /// Wire the services over explicit collaborators
    pub fn with_parts(
        config: &SquareConfig,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        let guard = DuplicateGuard::new(ledger.clone());
        let sync = SyncEngine::new(gateway.clone(), ledger.clone());

        Self {
            auto_charging: AutoChargingService::new(gateway.clone(), ledger.clone()),
            checkout: CheckoutService::new(
                config,
                gateway.clone(),
                ledger.clone(),
                directory.clone(),
                guard.clone(),
            ),
            subscriptions: SubscriptionService::new(gateway.clone(), ledger.clone(), sync.clone()),
            webhooks: WebhookHandler::new(
                config,
                gateway.clone(),
                ledger.clone(),
                directory,
                guard.clone(),
            ),
            gateway,
            guard,
            ledger,
            square_version: config.api_version.clone(),
            sync,
        }
    }

    /// Active subscription-backed memberships, for health reporting
    pub async fn active_subscription_count(&self) -> BillingResult<i64> {
        use crate::ledger::MembershipStore;

        Ok(self.ledger.subscription_health().await?.active_subscriptions)
    }
}
