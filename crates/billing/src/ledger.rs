//! Local ledger
//!
//! Relational state this service owns: membership rows, event enrollments,
//! payment attempts, stored webhook failures and auto-charging setups.
//!
//! Every check-then-act transition carries its guard in the UPDATE's WHERE
//! clause; callers act on the returned row count, never on a prior read.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_INACTIVE: &str = "inactive";

pub const SOURCE_NONE: &str = "none";
pub const SOURCE_SUBSCRIPTION: &str = "subscription";
pub const SOURCE_ONE_TIME: &str = "one-time";

pub const REMOTE_ACTIVE: &str = "ACTIVE";
pub const REMOTE_DELINQUENT: &str = "DELINQUENT";

/// Local `status` a remote subscription status implies for the full sync
pub fn expected_local_status(remote_status: &str) -> &'static str {
    if remote_status == REMOTE_ACTIVE {
        STATUS_ACTIVE
    } else {
        STATUS_INACTIVE
    }
}

/// One row of `customer_membership_plans`
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct MembershipRecord {
    pub customer_id: Uuid,
    pub membership_plan_id: Uuid,
    pub square_subscription_id: Option<String>,
    pub subscription_source: String,
    pub status: String,
    pub subscription_status: Option<String>,
    pub next_billing_date: Option<NaiveDate>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub renewal_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_created_at: Option<OffsetDateTime>,
}

impl MembershipRecord {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

/// Remote subscription facts written onto a membership row
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionLink {
    pub subscription_id: String,
    pub remote_status: String,
    pub created_at: Option<OffsetDateTime>,
    pub next_billing_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionHealth {
    pub total_subscriptions: i64,
    pub active_subscriptions: i64,
    pub missing_billing_dates: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookHealth {
    pub failed_webhooks_24h: i64,
    pub unprocessed_failures: i64,
}

/// Stored webhook event awaiting replay
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookFailureRecord {
    pub id: Uuid,
    pub event_type: Option<String>,
    pub event_data: serde_json::Value,
    pub error_message: String,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct AutoChargingCandidate {
    pub square_subscription_id: String,
    pub customer_id: Uuid,
    pub card_id: Option<String>,
    pub error_type: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoChargingCounts {
    pub total_active_subscriptions: i64,
    pub enabled: i64,
    pub failed: i64,
    pub unknown: i64,
    pub permanently_failed: i64,
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// `status = active` where it was not; true iff this call flipped the row
    async fn activate_if_inactive(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool>;

    /// Undo an activation whose remote subscription could not be created
    async fn revert_activation(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()>;

    async fn get_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Option<MembershipRecord>>;

    async fn get_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<MembershipRecord>>;

    /// Insert an already-active row; false when a row for the pair exists
    async fn insert_active_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        source: &str,
        renewal_date: Option<OffsetDateTime>,
    ) -> BillingResult<bool>;

    async fn attach_remote_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        link: &SubscriptionLink,
    ) -> BillingResult<()>;

    /// Fill in a subscription the processor created on its own. Matches the
    /// row already carrying this id, or the user's unlinked subscription row
    /// for `plan_id`. A reported billing date replaces the stored one.
    async fn backfill_created_subscription(
        &self,
        user_id: Uuid,
        plan_id: Option<Uuid>,
        link: &SubscriptionLink,
    ) -> BillingResult<u64>;

    /// ACTIVE -> active, CANCELED/PAUSED -> inactive, otherwise status kept
    async fn update_status_by_subscription(
        &self,
        subscription_id: &str,
        remote_status: &str,
    ) -> BillingResult<u64>;

    async fn mark_paid_by_subscription(
        &self,
        subscription_id: &str,
        next_billing_date: Option<NaiveDate>,
    ) -> BillingResult<u64>;

    async fn mark_delinquent(&self, subscription_id: &str) -> BillingResult<u64>;

    /// Deactivate the user's active subscription-sourced rows
    async fn deactivate_subscription_rows(
        &self,
        user_id: Uuid,
        plan_id: Option<Uuid>,
    ) -> BillingResult<u64>;

    /// Full-sync repair: mirror the remote status exactly
    async fn overwrite_remote_status(
        &self,
        subscription_id: &str,
        remote_status: &str,
    ) -> BillingResult<u64>;

    async fn set_next_billing_date(
        &self,
        subscription_id: &str,
        next_billing_date: NaiveDate,
    ) -> BillingResult<u64>;

    async fn list_linked_subscriptions(&self) -> BillingResult<Vec<MembershipRecord>>;

    /// Inactive subscription-sourced row created when checkout starts
    async fn upsert_checkout_placeholder(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()>;

    async fn owns_subscription(&self, user_id: Uuid, subscription_id: &str) -> BillingResult<bool>;

    async fn has_active_subscription(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool>;

    /// Active membership whose renewal date has not passed
    async fn has_covering_membership(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool>;

    /// Plan of the user's most recent unlinked, inactive subscription row
    async fn pending_subscription_plan(&self, user_id: Uuid) -> BillingResult<Option<Uuid>>;

    /// Deactivate rows whose renewal date passed without an active subscription
    async fn expire_lapsed_memberships(&self) -> BillingResult<u64>;

    async fn subscription_health(&self) -> BillingResult<SubscriptionHealth>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Pending enrollment expiring in 10 minutes; paid rows are left alone
    async fn upsert_pending_enrollment(&self, user_id: Uuid, event_id: Uuid) -> BillingResult<()>;

    async fn mark_enrollment_paid(&self, user_id: Uuid, event_id: Uuid) -> BillingResult<()>;
}

#[async_trait]
pub trait PaymentAttemptStore: Send + Sync {
    /// Completed attempt for the same amount in the last 10 minutes
    async fn recent_completed_payment(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
    ) -> BillingResult<bool>;

    async fn record_payment_attempt(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
        checkout_id: &str,
    ) -> BillingResult<()>;

    async fn update_payment_status(&self, checkout_id: &str, status: &str) -> BillingResult<()>;

    /// Move the user's pending attempts for a plan to `status`
    async fn resolve_pending_attempts(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        status: &str,
    ) -> BillingResult<u64>;
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn store_failure(
        &self,
        event_type: Option<&str>,
        event: &serde_json::Value,
        error_message: &str,
    ) -> BillingResult<()>;

    /// Up to `limit` unprocessed failures from the last 24 hours, oldest first
    async fn fetch_unprocessed(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>>;

    async fn mark_processed(&self, failure_id: Uuid) -> BillingResult<()>;

    async fn webhook_health(&self) -> BillingResult<WebhookHealth>;
}

#[async_trait]
pub trait AutoChargingStore: Send + Sync {
    async fn record_auto_charging_success(
        &self,
        subscription_id: &str,
        card_id: &str,
    ) -> BillingResult<()>;

    async fn record_auto_charging_failure(
        &self,
        subscription_id: &str,
        card_id: Option<&str>,
        error_type: &str,
        error_details: &str,
    ) -> BillingResult<()>;

    /// Failed, not permanently failed, touched within `max_age_hours`, under `max_retries`
    async fn auto_charging_retry_candidates(
        &self,
        max_retries: i32,
        max_age_hours: i32,
    ) -> BillingResult<Vec<AutoChargingCandidate>>;

    async fn increment_auto_charging_retry(&self, subscription_id: &str) -> BillingResult<()>;

    async fn mark_auto_charging_permanently_failed(&self, subscription_id: &str)
        -> BillingResult<()>;

    async fn auto_charging_counts(&self) -> BillingResult<AutoChargingCounts>;
}

/// Everything the reconciliation engine writes to
pub trait Ledger:
    MembershipStore + EnrollmentStore + PaymentAttemptStore + FailureStore + AutoChargingStore
{
}

impl<T> Ledger for T where
    T: MembershipStore + EnrollmentStore + PaymentAttemptStore + FailureStore + AutoChargingStore
{
}

fn db_err(e: sqlx::Error) -> BillingError {
    BillingError::Database(e.to_string())
}

const MEMBERSHIP_COLUMNS: &str = "customer_id, membership_plan_id, square_subscription_id, \
     subscription_source, status, subscription_status, next_billing_date, renewal_date, \
     subscription_created_at";

/// PostgreSQL-backed ledger
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MembershipStore for PgLedger {
    async fn activate_if_inactive(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET status = 'active', updated_at = NOW()
            WHERE customer_id = $1 AND membership_plan_id = $2 AND status != 'active'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert_activation(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET status = 'inactive', updated_at = NOW()
            WHERE customer_id = $1 AND membership_plan_id = $2
              AND status = 'active' AND square_subscription_id IS NULL
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Option<MembershipRecord>> {
        sqlx::query_as::<_, MembershipRecord>(&format!(
            "SELECT {} FROM customer_membership_plans \
             WHERE customer_id = $1 AND membership_plan_id = $2",
            MEMBERSHIP_COLUMNS
        ))
        .bind(user_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<MembershipRecord>> {
        sqlx::query_as::<_, MembershipRecord>(&format!(
            "SELECT {} FROM customer_membership_plans WHERE square_subscription_id = $1 LIMIT 1",
            MEMBERSHIP_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn insert_active_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        source: &str,
        renewal_date: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO customer_membership_plans
                (customer_id, membership_plan_id, status, subscription_source, renewal_date)
            VALUES ($1, $2, 'active', $3, $4)
            ON CONFLICT (customer_id, membership_plan_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(source)
        .bind(renewal_date)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn attach_remote_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        link: &SubscriptionLink,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET square_subscription_id = $3,
                subscription_status = $4,
                next_billing_date = $5,
                subscription_created_at = $6,
                updated_at = NOW()
            WHERE customer_id = $1 AND membership_plan_id = $2
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(&link.subscription_id)
        .bind(&link.remote_status)
        .bind(link.next_billing_date)
        .bind(link.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn backfill_created_subscription(
        &self,
        user_id: Uuid,
        plan_id: Option<Uuid>,
        link: &SubscriptionLink,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET square_subscription_id = $2,
                subscription_status = $3,
                subscription_source = 'subscription',
                next_billing_date = COALESCE($4, next_billing_date),
                subscription_created_at = COALESCE(subscription_created_at, $5),
                status = CASE WHEN $3 = 'ACTIVE' THEN 'active' ELSE 'inactive' END,
                updated_at = NOW()
            WHERE customer_id = $1
              AND (square_subscription_id = $2
                   OR (membership_plan_id = $6
                       AND subscription_source = 'subscription'
                       AND square_subscription_id IS NULL))
            "#,
        )
        .bind(user_id)
        .bind(&link.subscription_id)
        .bind(&link.remote_status)
        .bind(link.next_billing_date)
        .bind(link.created_at)
        .bind(plan_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn update_status_by_subscription(
        &self,
        subscription_id: &str,
        remote_status: &str,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET subscription_status = $2,
                status = CASE
                    WHEN $2 = 'ACTIVE' THEN 'active'
                    WHEN $2 IN ('CANCELED', 'PAUSED') THEN 'inactive'
                    ELSE status
                END,
                updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(remote_status)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn mark_paid_by_subscription(
        &self,
        subscription_id: &str,
        next_billing_date: Option<NaiveDate>,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET status = 'active',
                subscription_status = 'ACTIVE',
                next_billing_date = COALESCE($2, next_billing_date),
                updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(next_billing_date)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn mark_delinquent(&self, subscription_id: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET status = 'inactive', subscription_status = 'DELINQUENT', updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn deactivate_subscription_rows(
        &self,
        user_id: Uuid,
        plan_id: Option<Uuid>,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET status = 'inactive', updated_at = NOW()
            WHERE customer_id = $1
              AND ($2::uuid IS NULL OR membership_plan_id = $2)
              AND status = 'active'
              AND subscription_source = 'subscription'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn overwrite_remote_status(
        &self,
        subscription_id: &str,
        remote_status: &str,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET subscription_status = $2,
                status = CASE WHEN $2 = 'ACTIVE' THEN 'active' ELSE 'inactive' END,
                updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(remote_status)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn set_next_billing_date(
        &self,
        subscription_id: &str,
        next_billing_date: NaiveDate,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET next_billing_date = $2, updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(next_billing_date)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn list_linked_subscriptions(&self) -> BillingResult<Vec<MembershipRecord>> {
        sqlx::query_as::<_, MembershipRecord>(&format!(
            "SELECT {} FROM customer_membership_plans \
             WHERE square_subscription_id IS NOT NULL ORDER BY created_at",
            MEMBERSHIP_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn upsert_checkout_placeholder(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_membership_plans
                (customer_id, membership_plan_id, status, subscription_source)
            VALUES ($1, $2, 'inactive', 'subscription')
            ON CONFLICT (customer_id, membership_plan_id) DO UPDATE
                SET subscription_source = 'subscription', updated_at = NOW()
            WHERE customer_membership_plans.status != 'active'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn owns_subscription(&self, user_id: Uuid, subscription_id: &str) -> BillingResult<bool> {
        let owned: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM customer_membership_plans
            WHERE customer_id = $1 AND square_subscription_id = $2
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(owned.is_some())
    }

    async fn has_active_subscription(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM customer_membership_plans
            WHERE customer_id = $1 AND membership_plan_id = $2
              AND status = 'active' AND subscription_status = 'ACTIVE'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(count > 0)
    }

    async fn has_covering_membership(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM customer_membership_plans
            WHERE customer_id = $1 AND membership_plan_id = $2
              AND status = 'active'
              AND (renewal_date IS NULL OR renewal_date > NOW())
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(count > 0)
    }

    async fn pending_subscription_plan(&self, user_id: Uuid) -> BillingResult<Option<Uuid>> {
        sqlx::query_scalar(
            r#"
            SELECT membership_plan_id FROM customer_membership_plans
            WHERE customer_id = $1
              AND subscription_source = 'subscription'
              AND square_subscription_id IS NULL
              AND status != 'active'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn expire_lapsed_memberships(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_membership_plans
            SET status = 'inactive', updated_at = NOW()
            WHERE status = 'active'
              AND renewal_date IS NOT NULL
              AND renewal_date < NOW()
              AND subscription_status IS DISTINCT FROM 'ACTIVE'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn subscription_health(&self) -> BillingResult<SubscriptionHealth> {
        let (total, active, missing): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE subscription_status = 'ACTIVE'),
                   COUNT(*) FILTER (WHERE next_billing_date IS NULL AND subscription_status = 'ACTIVE')
            FROM customer_membership_plans
            WHERE square_subscription_id IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(SubscriptionHealth {
            total_subscriptions: total,
            active_subscriptions: active,
            missing_billing_dates: missing,
        })
    }
}

#[async_trait]
impl EnrollmentStore for PgLedger {
    async fn upsert_pending_enrollment(&self, user_id: Uuid, event_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_enrollment (customer_id, event_id, payment_status, payment_expired_at)
            VALUES ($1, $2, 'pending', NOW() + INTERVAL '10 minutes')
            ON CONFLICT (customer_id, event_id) DO UPDATE
                SET payment_status = EXCLUDED.payment_status,
                    payment_expired_at = EXCLUDED.payment_expired_at
            WHERE customer_enrollment.payment_status != 'paid'
            "#,
        )
        .bind(user_id)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_enrollment_paid(&self, user_id: Uuid, event_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_enrollment (customer_id, event_id, payment_status, payment_expired_at)
            VALUES ($1, $2, 'paid', NULL)
            ON CONFLICT (customer_id, event_id) DO UPDATE
                SET payment_status = 'paid', payment_expired_at = NULL
            "#,
        )
        .bind(user_id)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl PaymentAttemptStore for PgLedger {
    async fn recent_completed_payment(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
    ) -> BillingResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM payment_history
            WHERE user_id = $1 AND plan_id = $2 AND amount = $3
              AND status = 'completed'
              AND created_at > NOW() - INTERVAL '10 minutes'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(count > 0)
    }

    async fn record_payment_attempt(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
        checkout_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_history (user_id, plan_id, amount, checkout_id, status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (checkout_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(amount)
        .bind(checkout_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_payment_status(&self, checkout_id: &str, status: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE payment_history SET status = $2, updated_at = NOW() WHERE checkout_id = $1",
        )
        .bind(checkout_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn resolve_pending_attempts(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        status: &str,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_history
            SET status = $3, updated_at = NOW()
            WHERE user_id = $1 AND plan_id = $2 AND status = 'pending'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FailureStore for PgLedger {
    async fn store_failure(
        &self,
        event_type: Option<&str>,
        event: &serde_json::Value,
        error_message: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_failures (event_type, event_data, error_message, processed)
            VALUES ($1, $2, $3, false)
            "#,
        )
        .bind(event_type)
        .bind(event)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fetch_unprocessed(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>> {
        sqlx::query_as::<_, WebhookFailureRecord>(
            r#"
            SELECT id, event_type, event_data, error_message, processed, created_at
            FROM webhook_failures
            WHERE processed = false AND created_at > NOW() - INTERVAL '24 hours'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn mark_processed(&self, failure_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE webhook_failures SET processed = true WHERE id = $1")
            .bind(failure_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn webhook_health(&self) -> BillingResult<WebhookHealth> {
        let (failed, unprocessed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE processed = false)
            FROM webhook_failures
            WHERE created_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(WebhookHealth {
            failed_webhooks_24h: failed,
            unprocessed_failures: unprocessed,
        })
    }
}

#[async_trait]
impl AutoChargingStore for PgLedger {
    async fn record_auto_charging_success(
        &self,
        subscription_id: &str,
        card_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_auto_charging (square_subscription_id, enabled, card_id)
            VALUES ($1, true, $2)
            ON CONFLICT (square_subscription_id) DO UPDATE
                SET enabled = true,
                    card_id = EXCLUDED.card_id,
                    error_type = NULL,
                    error_details = NULL,
                    permanently_failed = false,
                    updated_at = NOW()
            "#,
        )
        .bind(subscription_id)
        .bind(card_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_auto_charging_failure(
        &self,
        subscription_id: &str,
        card_id: Option<&str>,
        error_type: &str,
        error_details: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_auto_charging
                (square_subscription_id, enabled, card_id, error_type, error_details)
            VALUES ($1, false, $2, $3, $4)
            ON CONFLICT (square_subscription_id) DO UPDATE
                SET enabled = false,
                    card_id = COALESCE(EXCLUDED.card_id, subscription_auto_charging.card_id),
                    error_type = EXCLUDED.error_type,
                    error_details = EXCLUDED.error_details,
                    updated_at = NOW()
            "#,
        )
        .bind(subscription_id)
        .bind(card_id)
        .bind(error_type)
        .bind(error_details)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn auto_charging_retry_candidates(
        &self,
        max_retries: i32,
        max_age_hours: i32,
    ) -> BillingResult<Vec<AutoChargingCandidate>> {
        sqlx::query_as::<_, AutoChargingCandidate>(
            r#"
            SELECT sac.square_subscription_id, cmp.customer_id, sac.card_id,
                   sac.error_type, sac.retry_count
            FROM subscription_auto_charging sac
            JOIN customer_membership_plans cmp
              ON cmp.square_subscription_id = sac.square_subscription_id
            WHERE sac.enabled = false
              AND sac.error_type IS NOT NULL
              AND sac.permanently_failed = false
              AND sac.retry_count < $1
              AND sac.updated_at > NOW() - make_interval(hours => $2)
              AND cmp.status = 'active'
            ORDER BY sac.updated_at DESC
            "#,
        )
        .bind(max_retries)
        .bind(max_age_hours)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn increment_auto_charging_retry(&self, subscription_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscription_auto_charging
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_auto_charging_permanently_failed(
        &self,
        subscription_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscription_auto_charging
            SET permanently_failed = true, updated_at = NOW()
            WHERE square_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn auto_charging_counts(&self) -> BillingResult<AutoChargingCounts> {
        let (total, enabled, failed, unknown, permanently_failed): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COUNT(*) FILTER (WHERE sac.enabled = true),
                       COUNT(*) FILTER (WHERE sac.enabled = false AND sac.error_type IS NOT NULL
                                        AND sac.permanently_failed = false),
                       COUNT(*) FILTER (WHERE sac.square_subscription_id IS NULL),
                       COUNT(*) FILTER (WHERE sac.permanently_failed = true)
                FROM customer_membership_plans cmp
                LEFT JOIN subscription_auto_charging sac
                  ON sac.square_subscription_id = cmp.square_subscription_id
                WHERE cmp.status = 'active' AND cmp.subscription_source = 'subscription'
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(AutoChargingCounts {
            total_active_subscriptions: total,
            enabled,
            failed,
            unknown,
            permanently_failed,
        })
    }
}
