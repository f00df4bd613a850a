//! Duplicate prevention
//!
//! Two layers: short-lived in-process caches (checkout debounce, processed
//! payment ids) and persisted checks against the ledger (active subscription,
//! identical recent payment). The caches are per process; only the ledger's
//! conditional writes are shared across instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::Ledger;

pub const CHECKOUT_WINDOW: Duration = Duration::from_secs(30);
pub const PAYMENT_WINDOW: Duration = Duration::from_secs(60 * 60);
pub const CHECKOUT_RETENTION: Duration = Duration::from_secs(5 * 60);
pub const PAYMENT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Deterministic idempotency keys sent to Square
pub mod keys {
    use std::fmt::Display;

    pub fn checkout(user: impl Display, plan: impl Display) -> String {
        format!("checkout-{}-{}", user, plan)
    }

    pub fn subscription(user: impl Display, plan: impl Display) -> String {
        format!("subscription-{}-{}", user, plan)
    }

    pub fn order_template(user: impl Display, plan: impl Display) -> String {
        format!("order-template-{}-{}", user, plan)
    }

    pub fn customer(user: impl Display) -> String {
        format!("customer-{}", user)
    }

    pub fn event(user: impl Display, event: impl Display) -> String {
        format!("event-{}-{}", user, event)
    }
}

/// Keyed timestamps with time-based expiry
#[async_trait]
pub trait DuplicateCache: Send + Sync {
    /// True if `key` was recorded less than `window` ago; otherwise records it now
    async fn check_and_record(&self, key: &str, window: Duration) -> bool;

    async fn seen_within(&self, key: &str, window: Duration) -> bool;

    async fn record(&self, key: &str);

    /// Drop entries older than `age`, returning how many were removed
    async fn evict_older_than(&self, age: Duration) -> usize;
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Instant>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DuplicateCache for InMemoryCache {
    async fn check_and_record(&self, key: &str, window: Duration) -> bool {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if let Some(at) = entries.get(key) {
            if now.duration_since(*at) < window {
                return true;
            }
        }
        entries.insert(key.to_string(), now);
        false
    }

    async fn seen_within(&self, key: &str, window: Duration) -> bool {
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|at| at.elapsed() < window)
    }

    async fn record(&self, key: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), Instant::now());
    }

    async fn evict_older_than(&self, age: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, at| at.elapsed() <= age);
        before - entries.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub checkouts_evicted: usize,
    pub payments_evicted: usize,
}

/// Checkout and payment duplicate detection
#[derive(Clone)]
pub struct DuplicateGuard {
    checkouts: Arc<dyn DuplicateCache>,
    payments: Arc<dyn DuplicateCache>,
    ledger: Arc<dyn Ledger>,
}

impl DuplicateGuard {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self::with_caches(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryCache::new()),
            ledger,
        )
    }

    pub fn with_caches(
        checkouts: Arc<dyn DuplicateCache>,
        payments: Arc<dyn DuplicateCache>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            checkouts,
            payments,
            ledger,
        }
    }

    /// Same user and plan asked for checkout within the last 30 seconds
    pub async fn is_duplicate_checkout_request(&self, user_id: Uuid, plan_id: Uuid) -> bool {
        let key = format!("{}-{}", user_id, plan_id);
        let duplicate = self.checkouts.check_and_record(&key, CHECKOUT_WINDOW).await;
        if duplicate {
            tracing::warn!(
                user_id = %user_id,
                plan_id = %plan_id,
                "Duplicate checkout request within debounce window"
            );
        }
        duplicate
    }

    pub async fn has_existing_active_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<bool> {
        self.ledger.has_active_subscription(user_id, plan_id).await
    }

    pub async fn recent_identical_payment(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
    ) -> BillingResult<bool> {
        self.ledger
            .recent_completed_payment(user_id, plan_id, amount)
            .await
    }

    /// Payment already processed successfully by this process
    pub async fn is_duplicate_payment_webhook(&self, payment_id: &str) -> bool {
        self.payments
            .seen_within(&payment_key(payment_id), PAYMENT_WINDOW)
            .await
    }

    /// Call only after the payment's processing succeeded
    pub async fn mark_payment_processed(&self, payment_id: &str) {
        self.payments.record(&payment_key(payment_id)).await;
    }

    pub async fn cleanup(&self) -> CleanupStats {
        let stats = CleanupStats {
            checkouts_evicted: self.checkouts.evict_older_than(CHECKOUT_RETENTION).await,
            payments_evicted: self.payments.evict_older_than(PAYMENT_RETENTION).await,
        };
        if stats.checkouts_evicted > 0 || stats.payments_evicted > 0 {
            tracing::info!(
                checkouts = stats.checkouts_evicted,
                payments = stats.payments_evicted,
                "Cleaned duplicate-prevention caches"
            );
        }
        stats
    }
}

fn payment_key(payment_id: &str) -> String {
    format!("payment-{}", payment_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryLedger;

    fn guard_with(checkouts: Arc<InMemoryCache>, payments: Arc<InMemoryCache>) -> DuplicateGuard {
        DuplicateGuard::with_caches(checkouts, payments, Arc::new(MemoryLedger::default()))
    }

    #[test]
    fn test_idempotency_keys_are_deterministic() {
        assert_eq!(keys::checkout("u1", "p1"), "checkout-u1-p1");
        assert_eq!(keys::subscription("u1", "p1"), "subscription-u1-p1");
        assert_eq!(keys::order_template("u1", "p1"), "order-template-u1-p1");
        assert_eq!(keys::customer("u1"), "customer-u1");
        assert_eq!(keys::event("u1", "e1"), "event-u1-e1");
    }

    #[tokio::test]
    async fn test_second_checkout_within_window_is_duplicate() {
        let checkouts = Arc::new(InMemoryCache::new());
        let guard = guard_with(checkouts.clone(), Arc::new(InMemoryCache::new()));
        let (user, plan) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(!guard.is_duplicate_checkout_request(user, plan).await);
        assert!(guard.is_duplicate_checkout_request(user, plan).await);
        assert!(!guard.is_duplicate_checkout_request(user, Uuid::new_v4()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_allowed_after_window() {
        let guard = guard_with(Arc::new(InMemoryCache::new()), Arc::new(InMemoryCache::new()));
        let (user, plan) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(!guard.is_duplicate_checkout_request(user, plan).await);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(guard.is_duplicate_checkout_request(user, plan).await);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!guard.is_duplicate_checkout_request(user, plan).await);
    }

    #[tokio::test]
    async fn test_payment_marked_only_when_asked() {
        let guard = guard_with(Arc::new(InMemoryCache::new()), Arc::new(InMemoryCache::new()));

        assert!(!guard.is_duplicate_payment_webhook("pay_1").await);
        assert!(!guard.is_duplicate_payment_webhook("pay_1").await);

        guard.mark_payment_processed("pay_1").await;
        assert!(guard.is_duplicate_payment_webhook("pay_1").await);
        assert!(!guard.is_duplicate_payment_webhook("pay_2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_by_class_retention() {
        let checkouts = Arc::new(InMemoryCache::new());
        let payments = Arc::new(InMemoryCache::new());
        let guard = guard_with(checkouts.clone(), payments.clone());
        let (user, plan) = (Uuid::new_v4(), Uuid::new_v4());

        guard.is_duplicate_checkout_request(user, plan).await;
        guard.mark_payment_processed("pay_old").await;
        tokio::time::advance(Duration::from_secs(61 * 60)).await;
        guard.mark_payment_processed("pay_new").await;

        let stats = guard.cleanup().await;
        assert_eq!(
            stats,
            CleanupStats {
                checkouts_evicted: 1,
                payments_evicted: 1
            }
        );
        assert!(checkouts.is_empty().await);
        assert_eq!(payments.len().await, 1);
        assert!(guard.is_duplicate_payment_webhook("pay_new").await);
    }
}
