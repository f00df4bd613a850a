//! Square API object shapes
//!
//! Only the fields reconciliation reads are modeled; everything else in the
//! Square payloads is ignored on deserialization.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteCustomer {
    pub id: String,
    pub email_address: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub plan_variation_id: Option<String>,
    pub card_id: Option<String>,
    pub charged_through_date: Option<String>,
    pub next_billing_date: Option<String>,
    pub billing_anchor_date: Option<String>,
    pub monthly_billing_anchor_date: Option<u32>,
    pub created_at: Option<String>,
}

impl RemoteSubscription {
    /// First billing date Square reports, in the order Square fills them in
    pub fn reported_billing_date(&self) -> Option<NaiveDate> {
        [
            &self.charged_through_date,
            &self.next_billing_date,
            &self.billing_anchor_date,
        ]
        .into_iter()
        .flatten()
        .find_map(|raw| parse_date(raw))
    }

    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("ACTIVE")
    }

    pub fn created_at(&self) -> Option<time::OffsetDateTime> {
        self.created_at.as_deref().and_then(|raw| {
            time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
        })
    }
}

/// Square dates are `YYYY-MM-DD`; tolerate full timestamps too
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub id: String,
    pub customer_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub line_items: Vec<OrderLineItem>,
}

impl RemoteOrder {
    /// Order-level metadata, else the first line item carrying any
    pub fn effective_metadata(&self) -> Option<(&HashMap<String, String>, MetadataSource)> {
        if !self.metadata.is_empty() {
            return Some((&self.metadata, MetadataSource::Order));
        }
        self.line_items
            .iter()
            .find(|li| !li.metadata.is_empty())
            .map(|li| (&li.metadata, MetadataSource::LineItem))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSource {
    Order,
    LineItem,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardRef {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardDetails {
    pub card: Option<CardRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotePayment {
    pub id: String,
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub card_details: Option<CardDetails>,
}

impl RemotePayment {
    pub fn card_id(&self) -> Option<&str> {
        self.card_details
            .as_ref()
            .and_then(|d| d.card.as_ref())
            .and_then(|c| c.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasePricing {
    #[serde(rename = "type")]
    pub pricing_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanPhase {
    pub ordinal: Option<i64>,
    pub cadence: Option<String>,
    pub pricing: Option<PhasePricing>,
    pub recurring_price_money: Option<Money>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanVariationData {
    pub name: Option<String>,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanVariation {
    pub id: String,
    pub subscription_plan_variation_data: Option<PlanVariationData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPlanData {
    pub name: Option<String>,
    #[serde(default)]
    pub subscription_plan_variations: Vec<PlanVariation>,
}

/// Catalog object: either a subscription plan or one of its variations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogObject {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: Option<String>,
    pub subscription_plan_data: Option<SubscriptionPlanData>,
    pub subscription_plan_variation_data: Option<PlanVariationData>,
}

impl CatalogObject {
    pub fn phases(&self) -> &[PlanPhase] {
        self.subscription_plan_variation_data
            .as_ref()
            .map(|d| d.phases.as_slice())
            .unwrap_or(&[])
    }

    pub fn cadence(&self) -> Option<&str> {
        self.phases().first().and_then(|p| p.cadence.as_deref())
    }

    /// Relative-priced plans need an order template per subscription
    pub fn has_relative_pricing(&self) -> bool {
        self.phases().iter().any(|p| {
            p.pricing
                .as_ref()
                .and_then(|pr| pr.pricing_type.as_deref())
                == Some("RELATIVE")
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentLink {
    pub id: String,
    pub url: Option<String>,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub id: String,
    pub subscription_event_type: Option<String>,
    pub effective_date: Option<String>,
    pub plan_variation_id: Option<String>,
}

/// Subscription plan variation flattened for the admin listing
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub plan_id: String,
    pub variation_id: String,
    pub name: Option<String>,
    pub cadence: Option<String>,
    pub pricing: Option<Money>,
}

impl PlanSummary {
    pub fn from_catalog(objects: &[CatalogObject]) -> Vec<PlanSummary> {
        objects
            .iter()
            .filter(|o| o.object_type.as_deref() == Some("SUBSCRIPTION_PLAN"))
            .flat_map(|plan| {
                let data = plan.subscription_plan_data.clone().unwrap_or_default();
                let name = data.name;
                data.subscription_plan_variations
                    .into_iter()
                    .map(move |variation| {
                        let first_phase = variation
                            .subscription_plan_variation_data
                            .as_ref()
                            .and_then(|d| d.phases.first().cloned());
                        PlanSummary {
                            plan_id: plan.id.clone(),
                            variation_id: variation.id.clone(),
                            name: name.clone(),
                            cadence: first_phase.as_ref().and_then(|p| p.cadence.clone()),
                            pricing: first_phase.and_then(|p| p.recurring_price_money),
                        }
                    })
            })
            .collect()
    }
}
