//! Read access to entities owned by the wider application
//!
//! Users, membership plans and events live in tables this service does not
//! own. The only write is linking a user to their Square customer.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub square_customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PlanRecord {
    pub id: Uuid,
    pub name: String,
    /// Square subscription plan variation id
    pub remote_variation_id: Option<String>,
    pub price_cents: Option<i64>,
    pub cadence_hint: Option<String>,
    /// Months a one-time purchase covers
    pub amt_periods: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    pub name: String,
    /// Square catalog item variation sold for this event
    pub price_ref: Option<String>,
    /// Membership plan whose holders attend for free
    pub required_plan_id: Option<Uuid>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>>;
    async fn get_user_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>>;
    async fn get_user_by_customer_id(&self, customer_id: &str)
        -> BillingResult<Option<UserRecord>>;
    async fn set_remote_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<PlanRecord>>;
    /// Plan sold through the given Square subscription plan variation
    async fn get_plan_by_variation(&self, variation_id: &str)
        -> BillingResult<Option<PlanRecord>>;
}

#[async_trait]
pub trait EventCatalog: Send + Sync {
    async fn get_event(&self, event_id: Uuid) -> BillingResult<Option<EventRecord>>;
}

/// User, plan and event lookups in one handle
pub trait Directory: UserDirectory + PlanCatalog + EventCatalog {}

impl<T> Directory for T where T: UserDirectory + PlanCatalog + EventCatalog {}

#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> BillingError {
    BillingError::Database(e.to_string())
}

#[async_trait]
impl UserDirectory for PgDirectory {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(
            "SELECT id, email, first_name, last_name, square_customer_id FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_user_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, first_name, last_name, square_customer_id
            FROM users WHERE LOWER(email) = LOWER($1)
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_user_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, first_name, last_name, square_customer_id
            FROM users WHERE square_customer_id = $1
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_remote_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query("UPDATE users SET square_customer_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl PlanCatalog for PgDirectory {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<PlanRecord>> {
        sqlx::query_as::<_, PlanRecord>(
            r#"
            SELECT id, name, square_variation_id AS remote_variation_id,
                   unit_amount AS price_cents, cadence AS cadence_hint, amt_periods
            FROM membership_plans WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_plan_by_variation(
        &self,
        variation_id: &str,
    ) -> BillingResult<Option<PlanRecord>> {
        sqlx::query_as::<_, PlanRecord>(
            r#"
            SELECT id, name, square_variation_id AS remote_variation_id,
                   unit_amount AS price_cents, cadence AS cadence_hint, amt_periods
            FROM membership_plans WHERE square_variation_id = $1
            LIMIT 1
            "#,
        )
        .bind(variation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl EventCatalog for PgDirectory {
    async fn get_event(&self, event_id: Uuid) -> BillingResult<Option<EventRecord>> {
        sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, name, square_price_id AS price_ref, required_membership_plan_id AS required_plan_id
            FROM events WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }
}
