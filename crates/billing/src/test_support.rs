//! In-memory fakes for the ledger, directory and Square gateway
//!
//! The ledger fake applies every conditional write under one mutex, which
//! gives the same single-winner behaviour as the SQL WHERE guards. Time
//! windows (10 minute payments, 24 hour failures) are not modeled.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{
    NewCustomer, NewDraftOrder, NewPaymentLink, NewSubscription, PaymentGateway, RemoteResult,
};
use crate::directory::{
    EventCatalog, EventRecord, PlanCatalog, PlanRecord, UserDirectory, UserRecord,
};
use crate::error::{BillingResult, RemoteError};
use crate::ledger::{
    AutoChargingCandidate, AutoChargingCounts, AutoChargingStore, EnrollmentStore, FailureStore,
    MembershipRecord, MembershipStore, PaymentAttemptStore, SubscriptionHealth, SubscriptionLink,
    WebhookFailureRecord, WebhookHealth, REMOTE_ACTIVE, REMOTE_DELINQUENT, SOURCE_SUBSCRIPTION,
    STATUS_ACTIVE, STATUS_INACTIVE,
};
use crate::models::{
    CatalogObject, PaymentLink, PlanPhase, PlanVariationData, RemoteCustomer, RemoteOrder,
    RemotePayment, RemoteSubscription, SubscriptionEvent,
};

// ============ LEDGER ============

#[derive(Debug, Clone)]
struct MembershipRow {
    record: MembershipRecord,
    touched: u64,
}

#[derive(Debug, Clone)]
struct PaymentAttempt {
    user_id: Uuid,
    plan_id: Uuid,
    amount: i64,
    checkout_id: String,
    status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoChargingRow {
    pub enabled: bool,
    pub card_id: Option<String>,
    pub error_type: Option<String>,
    pub error_details: Option<String>,
    pub retry_count: i32,
    pub permanently_failed: bool,
}

#[derive(Default)]
struct LedgerState {
    memberships: Vec<MembershipRow>,
    clock: u64,
    enrollments: HashMap<(Uuid, Uuid), String>,
    attempts: Vec<PaymentAttempt>,
    failures: Vec<WebhookFailureRecord>,
    auto_charging: HashMap<String, AutoChargingRow>,
}

impl LedgerState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn find(&mut self, user_id: Uuid, plan_id: Uuid) -> Option<&mut MembershipRow> {
        self.memberships.iter_mut().find(|r| {
            r.record.customer_id == user_id && r.record.membership_plan_id == plan_id
        })
    }

    /// Apply `f` to every row linked to `subscription_id`, returning the count
    fn update_by_subscription(
        &mut self,
        subscription_id: &str,
        f: impl Fn(&mut MembershipRecord),
    ) -> u64 {
        let now = self.tick();
        let mut count = 0;
        for row in self
            .memberships
            .iter_mut()
            .filter(|r| r.record.square_subscription_id.as_deref() == Some(subscription_id))
        {
            f(&mut row.record);
            row.touched = now;
            count += 1;
        }
        count
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

pub fn blank_membership(user_id: Uuid, plan_id: Uuid, status: &str) -> MembershipRecord {
    MembershipRecord {
        customer_id: user_id,
        membership_plan_id: plan_id,
        square_subscription_id: None,
        subscription_source: SOURCE_SUBSCRIPTION.to_string(),
        status: status.to_string(),
        subscription_status: None,
        next_billing_date: None,
        renewal_date: None,
        subscription_created_at: None,
    }
}

impl MemoryLedger {
    pub fn membership(&self, user_id: Uuid, plan_id: Uuid) -> Option<MembershipRecord> {
        let mut state = self.state.lock().unwrap();
        state.find(user_id, plan_id).map(|r| r.record.clone())
    }

    pub fn seed(&self, record: MembershipRecord) {
        let mut state = self.state.lock().unwrap();
        let touched = state.tick();
        state
            .memberships
            .retain(|r| {
                !(r.record.customer_id == record.customer_id
                    && r.record.membership_plan_id == record.membership_plan_id)
            });
        state.memberships.push(MembershipRow { record, touched });
    }

    /// Active row linked to an ACTIVE remote subscription
    pub fn seed_active_subscription(&self, user_id: Uuid, plan_id: Uuid, subscription_id: &str) {
        self.seed(MembershipRecord {
            square_subscription_id: Some(subscription_id.to_string()),
            subscription_status: Some(REMOTE_ACTIVE.to_string()),
            ..blank_membership(user_id, plan_id, STATUS_ACTIVE)
        });
    }

    pub fn memberships(&self) -> Vec<MembershipRecord> {
        let state = self.state.lock().unwrap();
        state.memberships.iter().map(|r| r.record.clone()).collect()
    }

    pub fn failures(&self) -> Vec<WebhookFailureRecord> {
        self.state.lock().unwrap().failures.clone()
    }

    pub fn enrollment_status(&self, user_id: Uuid, event_id: Uuid) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.enrollments.get(&(user_id, event_id)).cloned()
    }

    pub fn attempt_statuses(&self, user_id: Uuid, plan_id: Uuid) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .attempts
            .iter()
            .filter(|a| a.user_id == user_id && a.plan_id == plan_id)
            .map(|a| a.status.clone())
            .collect()
    }

    pub fn auto_charging(&self, subscription_id: &str) -> Option<AutoChargingRow> {
        let state = self.state.lock().unwrap();
        state.auto_charging.get(subscription_id).cloned()
    }
}

#[async_trait]
impl MembershipStore for MemoryLedger {
    async fn activate_if_inactive(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        Ok(match state.find(user_id, plan_id) {
            Some(row) if row.record.status != STATUS_ACTIVE => {
                row.record.status = STATUS_ACTIVE.to_string();
                row.touched = now;
                true
            }
            _ => false,
        })
    }

    async fn revert_activation(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        if let Some(row) = state.find(user_id, plan_id) {
            if row.record.status == STATUS_ACTIVE && row.record.square_subscription_id.is_none() {
                row.record.status = STATUS_INACTIVE.to_string();
                row.touched = now;
            }
        }
        Ok(())
    }

    async fn get_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Option<MembershipRecord>> {
        Ok(self.membership(user_id, plan_id))
    }

    async fn get_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<MembershipRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .find(|r| r.record.square_subscription_id.as_deref() == Some(subscription_id))
            .map(|r| r.record.clone()))
    }

    async fn insert_active_membership(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        source: &str,
        renewal_date: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.find(user_id, plan_id).is_some() {
            return Ok(false);
        }
        let touched = state.tick();
        state.memberships.push(MembershipRow {
            record: MembershipRecord {
                subscription_source: source.to_string(),
                renewal_date,
                ..blank_membership(user_id, plan_id, STATUS_ACTIVE)
            },
            touched,
        });
        Ok(true)
    }

    async fn attach_remote_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        link: &SubscriptionLink,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        if let Some(row) = state.find(user_id, plan_id) {
            row.record.square_subscription_id = Some(link.subscription_id.clone());
            row.record.subscription_status = Some(link.remote_status.clone());
            row.record.next_billing_date = link.next_billing_date;
            row.record.subscription_created_at = link.created_at;
            row.touched = now;
        }
        Ok(())
    }

    async fn backfill_created_subscription(
        &self,
        user_id: Uuid,
        plan_id: Option<Uuid>,
        link: &SubscriptionLink,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let mut count = 0;
        for row in state.memberships.iter_mut().filter(|r| {
            r.record.customer_id == user_id
                && (r.record.square_subscription_id.as_deref()
                    == Some(link.subscription_id.as_str())
                    || (Some(r.record.membership_plan_id) == plan_id
                        && r.record.subscription_source == SOURCE_SUBSCRIPTION
                        && r.record.square_subscription_id.is_none()))
        }) {
            let rec = &mut row.record;
            rec.square_subscription_id = Some(link.subscription_id.clone());
            rec.subscription_status = Some(link.remote_status.clone());
            rec.subscription_source = SOURCE_SUBSCRIPTION.to_string();
            rec.next_billing_date = link.next_billing_date.or(rec.next_billing_date);
            rec.subscription_created_at = rec.subscription_created_at.or(link.created_at);
            rec.status = if link.remote_status == REMOTE_ACTIVE {
                STATUS_ACTIVE
            } else {
                STATUS_INACTIVE
            }
            .to_string();
            row.touched = now;
            count += 1;
        }
        Ok(count)
    }

    async fn update_status_by_subscription(
        &self,
        subscription_id: &str,
        remote_status: &str,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(state.update_by_subscription(subscription_id, |rec| {
            rec.subscription_status = Some(remote_status.to_string());
            match remote_status {
                "ACTIVE" => rec.status = STATUS_ACTIVE.to_string(),
                "CANCELED" | "PAUSED" => rec.status = STATUS_INACTIVE.to_string(),
                _ => {}
            }
        }))
    }

    async fn mark_paid_by_subscription(
        &self,
        subscription_id: &str,
        next_billing_date: Option<NaiveDate>,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(state.update_by_subscription(subscription_id, |rec| {
            rec.status = STATUS_ACTIVE.to_string();
            rec.subscription_status = Some(REMOTE_ACTIVE.to_string());
            rec.next_billing_date = next_billing_date.or(rec.next_billing_date);
        }))
    }

    async fn mark_delinquent(&self, subscription_id: &str) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(state.update_by_subscription(subscription_id, |rec| {
            rec.status = STATUS_INACTIVE.to_string();
            rec.subscription_status = Some(REMOTE_DELINQUENT.to_string());
        }))
    }

    async fn deactivate_subscription_rows(
        &self,
        user_id: Uuid,
        plan_id: Option<Uuid>,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let mut count = 0;
        for row in state.memberships.iter_mut().filter(|r| {
            r.record.customer_id == user_id
                && plan_id.map_or(true, |p| r.record.membership_plan_id == p)
                && r.record.status == STATUS_ACTIVE
                && r.record.subscription_source == SOURCE_SUBSCRIPTION
        }) {
            row.record.status = STATUS_INACTIVE.to_string();
            row.touched = now;
            count += 1;
        }
        Ok(count)
    }

    async fn overwrite_remote_status(
        &self,
        subscription_id: &str,
        remote_status: &str,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(state.update_by_subscription(subscription_id, |rec| {
            rec.subscription_status = Some(remote_status.to_string());
            rec.status = if remote_status == REMOTE_ACTIVE {
                STATUS_ACTIVE
            } else {
                STATUS_INACTIVE
            }
            .to_string();
        }))
    }

    async fn set_next_billing_date(
        &self,
        subscription_id: &str,
        next_billing_date: NaiveDate,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(state.update_by_subscription(subscription_id, |rec| {
            rec.next_billing_date = Some(next_billing_date);
        }))
    }

    async fn list_linked_subscriptions(&self) -> BillingResult<Vec<MembershipRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .filter(|r| r.record.square_subscription_id.is_some())
            .map(|r| r.record.clone())
            .collect())
    }

    async fn upsert_checkout_placeholder(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        match state.find(user_id, plan_id) {
            Some(row) => {
                if row.record.status != STATUS_ACTIVE {
                    row.record.subscription_source = SOURCE_SUBSCRIPTION.to_string();
                    row.touched = now;
                }
            }
            None => state.memberships.push(MembershipRow {
                record: blank_membership(user_id, plan_id, STATUS_INACTIVE),
                touched: now,
            }),
        }
        Ok(())
    }

    async fn owns_subscription(&self, user_id: Uuid, subscription_id: &str) -> BillingResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.memberships.iter().any(|r| {
            r.record.customer_id == user_id
                && r.record.square_subscription_id.as_deref() == Some(subscription_id)
        }))
    }

    async fn has_active_subscription(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool> {
        Ok(self.membership(user_id, plan_id).is_some_and(|r| {
            r.status == STATUS_ACTIVE && r.subscription_status.as_deref() == Some(REMOTE_ACTIVE)
        }))
    }

    async fn has_covering_membership(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self.membership(user_id, plan_id).is_some_and(|r| {
            r.status == STATUS_ACTIVE && r.renewal_date.map_or(true, |d| d > now)
        }))
    }

    async fn pending_subscription_plan(&self, user_id: Uuid) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .filter(|r| {
                r.record.customer_id == user_id
                    && r.record.subscription_source == SOURCE_SUBSCRIPTION
                    && r.record.square_subscription_id.is_none()
                    && r.record.status != STATUS_ACTIVE
            })
            .max_by_key(|r| r.touched)
            .map(|r| r.record.membership_plan_id))
    }

    async fn expire_lapsed_memberships(&self) -> BillingResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for row in state.memberships.iter_mut().filter(|r| {
            r.record.status == STATUS_ACTIVE
                && r.record.renewal_date.is_some_and(|d| d < now)
                && r.record.subscription_status.as_deref() != Some(REMOTE_ACTIVE)
        }) {
            row.record.status = STATUS_INACTIVE.to_string();
            count += 1;
        }
        Ok(count)
    }

    async fn subscription_health(&self) -> BillingResult<SubscriptionHealth> {
        let state = self.state.lock().unwrap();
        let linked: Vec<_> = state
            .memberships
            .iter()
            .filter(|r| r.record.square_subscription_id.is_some())
            .collect();
        let active = |r: &&&MembershipRow| {
            r.record.subscription_status.as_deref() == Some(REMOTE_ACTIVE)
        };
        Ok(SubscriptionHealth {
            total_subscriptions: linked.len() as i64,
            active_subscriptions: linked.iter().filter(active).count() as i64,
            missing_billing_dates: linked
                .iter()
                .filter(active)
                .filter(|r| r.record.next_billing_date.is_none())
                .count() as i64,
        })
    }
}

#[async_trait]
impl EnrollmentStore for MemoryLedger {
    async fn upsert_pending_enrollment(&self, user_id: Uuid, event_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let status = state
            .enrollments
            .entry((user_id, event_id))
            .or_insert_with(|| "pending".to_string());
        if status != "paid" {
            *status = "pending".to_string();
        }
        Ok(())
    }

    async fn mark_enrollment_paid(&self, user_id: Uuid, event_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .enrollments
            .insert((user_id, event_id), "paid".to_string());
        Ok(())
    }
}

#[async_trait]
impl PaymentAttemptStore for MemoryLedger {
    async fn recent_completed_payment(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
    ) -> BillingResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.attempts.iter().any(|a| {
            a.user_id == user_id && a.plan_id == plan_id && a.amount == amount
                && a.status == "completed"
        }))
    }

    async fn record_payment_attempt(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount: i64,
        checkout_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.attempts.iter().any(|a| a.checkout_id == checkout_id) {
            state.attempts.push(PaymentAttempt {
                user_id,
                plan_id,
                amount,
                checkout_id: checkout_id.to_string(),
                status: "pending".to_string(),
            });
        }
        Ok(())
    }

    async fn update_payment_status(&self, checkout_id: &str, status: &str) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        for attempt in state
            .attempts
            .iter_mut()
            .filter(|a| a.checkout_id == checkout_id)
        {
            attempt.status = status.to_string();
        }
        Ok(())
    }

    async fn resolve_pending_attempts(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        status: &str,
    ) -> BillingResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for attempt in state.attempts.iter_mut().filter(|a| {
            a.user_id == user_id && a.plan_id == plan_id && a.status == "pending"
        }) {
            attempt.status = status.to_string();
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl FailureStore for MemoryLedger {
    async fn store_failure(
        &self,
        event_type: Option<&str>,
        event: &serde_json::Value,
        error_message: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.failures.push(WebhookFailureRecord {
            id: Uuid::new_v4(),
            event_type: event_type.map(str::to_string),
            event_data: event.clone(),
            error_message: error_message.to_string(),
            processed: false,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn fetch_unprocessed(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .failures
            .iter()
            .filter(|f| !f.processed)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, failure_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.failures.iter_mut().find(|f| f.id == failure_id) {
            failure.processed = true;
        }
        Ok(())
    }

    async fn webhook_health(&self) -> BillingResult<WebhookHealth> {
        let state = self.state.lock().unwrap();
        Ok(WebhookHealth {
            failed_webhooks_24h: state.failures.len() as i64,
            unprocessed_failures: state.failures.iter().filter(|f| !f.processed).count() as i64,
        })
    }
}

#[async_trait]
impl AutoChargingStore for MemoryLedger {
    async fn record_auto_charging_success(
        &self,
        subscription_id: &str,
        card_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .auto_charging
            .entry(subscription_id.to_string())
            .or_default();
        row.enabled = true;
        row.card_id = Some(card_id.to_string());
        row.error_type = None;
        row.error_details = None;
        row.permanently_failed = false;
        Ok(())
    }

    async fn record_auto_charging_failure(
        &self,
        subscription_id: &str,
        card_id: Option<&str>,
        error_type: &str,
        error_details: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .auto_charging
            .entry(subscription_id.to_string())
            .or_default();
        row.enabled = false;
        if let Some(card) = card_id {
            row.card_id = Some(card.to_string());
        }
        row.error_type = Some(error_type.to_string());
        row.error_details = Some(error_details.to_string());
        Ok(())
    }

    async fn auto_charging_retry_candidates(
        &self,
        max_retries: i32,
        _max_age_hours: i32,
    ) -> BillingResult<Vec<AutoChargingCandidate>> {
        let state = self.state.lock().unwrap();
        let mut candidates: Vec<_> = state
            .auto_charging
            .iter()
            .filter(|(_, row)| {
                !row.enabled
                    && row.error_type.is_some()
                    && !row.permanently_failed
                    && row.retry_count < max_retries
            })
            .filter_map(|(sub_id, row)| {
                let member = state.memberships.iter().find(|m| {
                    m.record.square_subscription_id.as_deref() == Some(sub_id.as_str())
                        && m.record.status == STATUS_ACTIVE
                })?;
                Some(AutoChargingCandidate {
                    square_subscription_id: sub_id.clone(),
                    customer_id: member.record.customer_id,
                    card_id: row.card_id.clone(),
                    error_type: row.error_type.clone(),
                    retry_count: row.retry_count,
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.square_subscription_id.cmp(&b.square_subscription_id));
        Ok(candidates)
    }

    async fn increment_auto_charging_retry(&self, subscription_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.auto_charging.get_mut(subscription_id) {
            row.retry_count += 1;
        }
        Ok(())
    }

    async fn mark_auto_charging_permanently_failed(
        &self,
        subscription_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.auto_charging.get_mut(subscription_id) {
            row.permanently_failed = true;
        }
        Ok(())
    }

    async fn auto_charging_counts(&self) -> BillingResult<AutoChargingCounts> {
        let state = self.state.lock().unwrap();
        let mut counts = AutoChargingCounts::default();
        for member in state.memberships.iter().filter(|m| {
            m.record.status == STATUS_ACTIVE && m.record.subscription_source == SOURCE_SUBSCRIPTION
        }) {
            counts.total_active_subscriptions += 1;
            let row = member
                .record
                .square_subscription_id
                .as_ref()
                .and_then(|id| state.auto_charging.get(id));
            match row {
                None => counts.unknown += 1,
                Some(row) if row.enabled => counts.enabled += 1,
                Some(row) if row.permanently_failed => counts.permanently_failed += 1,
                Some(row) if row.error_type.is_some() => counts.failed += 1,
                Some(_) => {}
            }
        }
        Ok(counts)
    }
}

// ============ DIRECTORY ============

#[derive(Default)]
struct DirectoryState {
    users: HashMap<Uuid, UserRecord>,
    plans: HashMap<Uuid, PlanRecord>,
    events: HashMap<Uuid, EventRecord>,
}

#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    pub fn add_user(&self, user: UserRecord) {
        self.state.lock().unwrap().users.insert(user.id, user);
    }

    pub fn add_plan(&self, plan: PlanRecord) {
        self.state.lock().unwrap().plans.insert(plan.id, plan);
    }

    pub fn add_event(&self, event: EventRecord) {
        self.state.lock().unwrap().events.insert(event.id, event);
    }

    pub fn user(&self, user_id: Uuid) -> Option<UserRecord> {
        self.state.lock().unwrap().users.get(&user_id).cloned()
    }
}

#[async_trait]
impl UserDirectory for FakeDirectory {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        Ok(self.user(user_id))
    }

    async fn get_user_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn get_user_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .values()
            .find(|u| u.square_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn set_remote_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.get_mut(&user_id) {
            user.square_customer_id = Some(customer_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl PlanCatalog for FakeDirectory {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<PlanRecord>> {
        Ok(self.state.lock().unwrap().plans.get(&plan_id).cloned())
    }

    async fn get_plan_by_variation(
        &self,
        variation_id: &str,
    ) -> BillingResult<Option<PlanRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .plans
            .values()
            .find(|p| p.remote_variation_id.as_deref() == Some(variation_id))
            .cloned())
    }
}

#[async_trait]
impl EventCatalog for FakeDirectory {
    async fn get_event(&self, event_id: Uuid) -> BillingResult<Option<EventRecord>> {
        Ok(self.state.lock().unwrap().events.get(&event_id).cloned())
    }
}

// ============ GATEWAY ============

#[derive(Default)]
struct GatewayState {
    next_id: u64,
    customers: HashMap<String, RemoteCustomer>,
    subscriptions: HashMap<String, RemoteSubscription>,
    subscription_keys: HashMap<String, String>,
    plans: HashMap<String, CatalogObject>,
    orders: HashMap<String, RemoteOrder>,
    payments: HashMap<String, RemotePayment>,
    events: HashMap<String, Vec<SubscriptionEvent>>,
    checkouts: Vec<NewPaymentLink>,
    failures: HashMap<&'static str, RemoteError>,
    calls: HashMap<&'static str, usize>,
}

impl GatewayState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }
}

/// Square stand-in. Unknown ids are `NotFound`; unknown plan variations are
/// monthly; subscriptions are created ACTIVE and deduplicated by idempotency
/// key.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn add_customer(&self, customer: RemoteCustomer) {
        let mut state = self.state.lock().unwrap();
        state.customers.insert(customer.id.clone(), customer);
    }

    pub fn add_subscription(&self, sub: RemoteSubscription) {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.insert(sub.id.clone(), sub);
    }

    pub fn add_plan(&self, plan: CatalogObject) {
        let mut state = self.state.lock().unwrap();
        state.plans.insert(plan.id.clone(), plan);
    }

    pub fn add_order(&self, order: RemoteOrder) {
        let mut state = self.state.lock().unwrap();
        state.orders.insert(order.id.clone(), order);
    }

    pub fn add_payment(&self, payment: RemotePayment) {
        let mut state = self.state.lock().unwrap();
        state.payments.insert(payment.id.clone(), payment);
    }

    pub fn add_subscription_event(&self, subscription_id: &str, event: SubscriptionEvent) {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .entry(subscription_id.to_string())
            .or_default()
            .push(event);
    }

    /// Every later call of `operation` fails with `error` until cleared
    pub fn fail(&self, operation: &'static str, error: RemoteError) {
        self.state.lock().unwrap().failures.insert(operation, error);
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.state.lock().unwrap().failures.remove(operation);
    }

    pub fn calls(&self, operation: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(operation).copied().unwrap_or(0)
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<RemoteSubscription> {
        let state = self.state.lock().unwrap();
        state.subscriptions.get(subscription_id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    pub fn set_subscription_status(&self, subscription_id: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(sub) = state.subscriptions.get_mut(subscription_id) {
            sub.status = Some(status.to_string());
        }
    }

    pub fn last_checkout(&self) -> Option<NewPaymentLink> {
        self.state.lock().unwrap().checkouts.last().cloned()
    }

    /// Count the call and return the injected failure, if any
    fn enter(&self, operation: &'static str) -> RemoteResult<MutexGuard<'_, GatewayState>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(operation).or_default() += 1;
        let injected = state.failures.get(operation).cloned();
        match injected {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    fn update_subscription(
        &self,
        operation: &'static str,
        subscription_id: &str,
        f: impl FnOnce(&mut RemoteSubscription),
    ) -> RemoteResult<RemoteSubscription> {
        let mut state = self.enter(operation)?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| RemoteError::NotFound(subscription_id.to_string()))?;
        f(sub);
        Ok(sub.clone())
    }
}

fn monthly_variation(variation_id: &str) -> CatalogObject {
    CatalogObject {
        id: variation_id.to_string(),
        object_type: Some("SUBSCRIPTION_PLAN_VARIATION".to_string()),
        subscription_plan_variation_data: Some(PlanVariationData {
            name: None,
            phases: vec![PlanPhase {
                cadence: Some("MONTHLY".to_string()),
                ..Default::default()
            }],
        }),
        ..Default::default()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(&self, customer: &NewCustomer) -> RemoteResult<RemoteCustomer> {
        let mut state = self.enter("create_customer")?;
        let id = state.next("cust");
        let created = RemoteCustomer {
            id: id.clone(),
            email_address: Some(customer.email.clone()),
            given_name: customer.given_name.clone(),
            family_name: customer.family_name.clone(),
        };
        state.customers.insert(id, created.clone());
        Ok(created)
    }

    async fn get_customer(&self, customer_id: &str) -> RemoteResult<RemoteCustomer> {
        let state = self.enter("get_customer")?;
        state
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(customer_id.to_string()))
    }

    async fn get_subscription_plan(&self, variation_id: &str) -> RemoteResult<CatalogObject> {
        let state = self.enter("get_subscription_plan")?;
        Ok(state
            .plans
            .get(variation_id)
            .cloned()
            .unwrap_or_else(|| monthly_variation(variation_id)))
    }

    async fn list_subscription_plans(&self) -> RemoteResult<Vec<CatalogObject>> {
        let state = self.enter("list_subscription_plans")?;
        Ok(state.plans.values().cloned().collect())
    }

    async fn create_order(&self, order: &NewDraftOrder) -> RemoteResult<RemoteOrder> {
        let mut state = self.enter("create_order")?;
        let id = state.next("order");
        let created = RemoteOrder {
            id: id.clone(),
            ..Default::default()
        };
        tracing::debug!(key = %order.idempotency_key, order_id = %id, "fake order");
        state.orders.insert(id, created.clone());
        Ok(created)
    }

    async fn get_order(&self, order_id: &str) -> RemoteResult<RemoteOrder> {
        let state = self.enter("get_order")?;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(order_id.to_string()))
    }

    async fn get_payment(&self, payment_id: &str) -> RemoteResult<RemotePayment> {
        let state = self.enter("get_payment")?;
        state
            .payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(payment_id.to_string()))
    }

    async fn create_subscription(&self, sub: &NewSubscription) -> RemoteResult<RemoteSubscription> {
        let mut state = self.enter("create_subscription")?;
        if let Some(existing) = state
            .subscription_keys
            .get(&sub.idempotency_key)
            .and_then(|id| state.subscriptions.get(id))
        {
            return Ok(existing.clone());
        }
        let id = state.next("sub");
        let created = RemoteSubscription {
            id: id.clone(),
            status: Some(REMOTE_ACTIVE.to_string()),
            customer_id: Some(sub.customer_id.clone()),
            plan_variation_id: Some(sub.plan_variation_id.clone()),
            card_id: sub.card_id.clone(),
            ..Default::default()
        };
        state
            .subscription_keys
            .insert(sub.idempotency_key.clone(), id.clone());
        state.subscriptions.insert(id, created.clone());
        Ok(created)
    }

    async fn get_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription> {
        let state = self.enter("get_subscription")?;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(subscription_id.to_string()))
    }

    async fn update_subscription_card(
        &self,
        subscription_id: &str,
        card_id: &str,
    ) -> RemoteResult<RemoteSubscription> {
        self.update_subscription("update_subscription_card", subscription_id, |sub| {
            sub.card_id = Some(card_id.to_string())
        })
    }

    async fn pause_subscription(
        &self,
        subscription_id: &str,
        _pause_cycle_duration: Option<i64>,
    ) -> RemoteResult<RemoteSubscription> {
        self.update_subscription("pause_subscription", subscription_id, |sub| {
            sub.status = Some("PAUSED".to_string())
        })
    }

    async fn resume_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription> {
        self.update_subscription("resume_subscription", subscription_id, |sub| {
            sub.status = Some(REMOTE_ACTIVE.to_string())
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription> {
        self.update_subscription("cancel_subscription", subscription_id, |sub| {
            sub.status = Some("CANCELED".to_string())
        })
    }

    async fn list_subscription_events(
        &self,
        subscription_id: &str,
    ) -> RemoteResult<Vec<SubscriptionEvent>> {
        let state = self.enter("list_subscription_events")?;
        Ok(state
            .events
            .get(subscription_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_checkout_session(&self, link: &NewPaymentLink) -> RemoteResult<PaymentLink> {
        let mut state = self.enter("create_checkout_session")?;
        let id = state.next("link");
        state.checkouts.push(link.clone());
        Ok(PaymentLink {
            url: Some(format!("https://sandbox.square.link/u/{}", id)),
            order_id: Some(format!("order_{}", id)),
            id,
        })
    }
}
