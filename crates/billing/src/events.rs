//! Square webhook event model
//!
//! Raw notifications are parsed once into [`WebhookEvent`]; handlers match on
//! the variant instead of probing JSON.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentAmount {
    pub amount: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentCard {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentCardDetails {
    pub card: Option<PaymentCard>,
}

/// `data.object.payment`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentNotice {
    pub id: String,
    pub status: Option<String>,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
    pub amount_money: Option<PaymentAmount>,
    pub card_details: Option<PaymentCardDetails>,
}

impl PaymentNotice {
    pub fn card_id(&self) -> Option<&str> {
        self.card_details
            .as_ref()
            .and_then(|d| d.card.as_ref())
            .and_then(|c| c.id.as_deref())
    }

    pub fn amount(&self) -> Option<i64> {
        self.amount_money.as_ref().and_then(|m| m.amount)
    }

    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("COMPLETED")
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_deref(), Some("FAILED") | Some("CANCELED"))
    }
}

/// `data.object.subscription`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionNotice {
    pub id: String,
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub plan_variation_id: Option<String>,
}

/// `data.object.invoice`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceNotice {
    pub id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PaymentUpdated(PaymentNotice),
    SubscriptionCreated(SubscriptionNotice),
    SubscriptionUpdated(SubscriptionNotice),
    InvoicePaymentMade(InvoiceNotice),
    /// One of the configured delinquency event types
    InvoiceChargeFailed(InvoiceNotice),
    /// Other `invoice.*` events (created, published, ...)
    InvoiceOther { event_type: String },
    /// Known type whose object is missing or unreadable
    Malformed { event_type: String, reason: String },
    Unknown { event_type: String },
}

impl WebhookEvent {
    /// Classify a raw notification. Never fails: unrecognized shapes become
    /// `Unknown` or `Malformed`.
    pub fn parse(event: &Value, delinquency_events: &[String]) -> Self {
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match event_type.as_str() {
            "payment.updated" => match object::<PaymentNotice>(event, "payment") {
                Ok(p) => WebhookEvent::PaymentUpdated(p),
                Err(reason) => WebhookEvent::Malformed { event_type, reason },
            },
            "subscription.created" | "subscription.updated" => {
                match object::<SubscriptionNotice>(event, "subscription") {
                    Ok(s) if event_type == "subscription.created" => {
                        WebhookEvent::SubscriptionCreated(s)
                    }
                    Ok(s) => WebhookEvent::SubscriptionUpdated(s),
                    Err(reason) => WebhookEvent::Malformed { event_type, reason },
                }
            }
            t if t.starts_with("invoice.") => {
                let is_payment = t == "invoice.payment_made";
                let is_delinquency = delinquency_events.iter().any(|d| d == t);
                if !is_payment && !is_delinquency {
                    return WebhookEvent::InvoiceOther { event_type };
                }
                match object::<InvoiceNotice>(event, "invoice") {
                    Ok(i) if is_payment => WebhookEvent::InvoicePaymentMade(i),
                    Ok(i) => WebhookEvent::InvoiceChargeFailed(i),
                    Err(reason) => WebhookEvent::Malformed { event_type, reason },
                }
            }
            _ => WebhookEvent::Unknown { event_type },
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            WebhookEvent::PaymentUpdated(_) => "payment.updated",
            WebhookEvent::SubscriptionCreated(_) => "subscription.created",
            WebhookEvent::SubscriptionUpdated(_) => "subscription.updated",
            WebhookEvent::InvoicePaymentMade(_) => "invoice.payment_made",
            WebhookEvent::InvoiceChargeFailed(_) => "invoice.charge_failed",
            WebhookEvent::InvoiceOther { event_type }
            | WebhookEvent::Malformed { event_type, .. }
            | WebhookEvent::Unknown { event_type } => event_type,
        }
    }
}

fn object<T: DeserializeOwned>(event: &Value, key: &str) -> Result<T, String> {
    let raw = event
        .pointer(&format!("/data/object/{}", key))
        .filter(|v| !v.is_null())
        .ok_or_else(|| format!("missing data.object.{}", key))?;
    serde_json::from_value(raw.clone()).map_err(|e| e.to_string())
}
