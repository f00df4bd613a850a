//! Square API client
//!
//! Thin authenticated wrapper over the Square REST API. Every operation is
//! one logical remote call run under the client's [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SquareConfig;
use crate::error::{BillingError, BillingResult, RemoteError};
use crate::models::{
    CatalogObject, PaymentLink, RemoteCustomer, RemoteOrder, RemotePayment, RemoteSubscription,
    SubscriptionEvent,
};
use crate::retry::RetryPolicy;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub idempotency_key: String,
    pub email: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub reference_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub idempotency_key: String,
    pub location_id: String,
    pub plan_variation_id: String,
    pub customer_id: String,
    /// Order template for the first phase of relative-priced plans
    pub order_template_id: Option<String>,
    pub card_id: Option<String>,
}

/// Line item priced directly (no catalog reference)
#[derive(Debug, Clone)]
pub struct AdHocLineItem {
    pub name: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct NewDraftOrder {
    pub idempotency_key: String,
    pub location_id: String,
    pub line_item: AdHocLineItem,
}

#[derive(Debug, Clone)]
pub enum CheckoutLineItem {
    AdHoc(AdHocLineItem),
    /// Catalog item variation
    Catalog { variation_id: String },
}

#[derive(Debug, Clone)]
pub struct NewPaymentLink {
    pub idempotency_key: String,
    pub location_id: String,
    pub line_items: Vec<CheckoutLineItem>,
    pub metadata: Vec<(String, String)>,
    pub redirect_url: Option<String>,
    pub buyer_email: Option<String>,
}

/// Operations the reconciliation core needs from the payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, customer: &NewCustomer) -> RemoteResult<RemoteCustomer>;
    async fn get_customer(&self, customer_id: &str) -> RemoteResult<RemoteCustomer>;
    async fn get_subscription_plan(&self, variation_id: &str) -> RemoteResult<CatalogObject>;
    async fn list_subscription_plans(&self) -> RemoteResult<Vec<CatalogObject>>;
    async fn create_order(&self, order: &NewDraftOrder) -> RemoteResult<RemoteOrder>;
    async fn get_order(&self, order_id: &str) -> RemoteResult<RemoteOrder>;
    async fn get_payment(&self, payment_id: &str) -> RemoteResult<RemotePayment>;
    async fn create_subscription(&self, sub: &NewSubscription) -> RemoteResult<RemoteSubscription>;
    async fn get_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription>;
    async fn update_subscription_card(
        &self,
        subscription_id: &str,
        card_id: &str,
    ) -> RemoteResult<RemoteSubscription>;
    async fn pause_subscription(
        &self,
        subscription_id: &str,
        pause_cycle_duration: Option<i64>,
    ) -> RemoteResult<RemoteSubscription>;
    async fn resume_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription>;
    async fn cancel_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription>;
    async fn list_subscription_events(
        &self,
        subscription_id: &str,
    ) -> RemoteResult<Vec<SubscriptionEvent>>;
    async fn create_checkout_session(&self, link: &NewPaymentLink) -> RemoteResult<PaymentLink>;
}

#[derive(Debug, Deserialize)]
struct CustomerEnvelope {
    customer: RemoteCustomer,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEnvelope {
    subscription: RemoteSubscription,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: RemoteOrder,
}

#[derive(Debug, Deserialize)]
struct PaymentEnvelope {
    payment: RemotePayment,
}

#[derive(Debug, Deserialize)]
struct CatalogEnvelope {
    object: CatalogObject,
}

#[derive(Debug, Deserialize)]
struct CatalogListEnvelope {
    #[serde(default)]
    objects: Vec<CatalogObject>,
}

#[derive(Debug, Deserialize)]
struct PaymentLinkEnvelope {
    payment_link: PaymentLink,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEventsEnvelope {
    #[serde(default)]
    subscription_events: Vec<SubscriptionEvent>,
}

/// Square REST client
#[derive(Clone)]
pub struct SquareClient {
    http: reqwest::Client,
    config: Arc<SquareConfig>,
    retry: RetryPolicy,
}

impl SquareClient {
    pub fn new(config: SquareConfig) -> BillingResult<Self> {
        Self::with_retry(config, RetryPolicy::default())
    }

    pub fn with_retry(config: SquareConfig, retry: RetryPolicy) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config: Arc::new(config),
            retry,
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(SquareConfig::from_env()?)
    }

    pub fn config(&self) -> &SquareConfig {
        &self.config
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> RemoteResult<T> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        self.retry
            .run(operation, || {
                let mut builder = self
                    .http
                    .request(method.clone(), &url)
                    .bearer_auth(&self.config.access_token)
                    .header("Square-Version", &self.config.api_version)
                    .header("Accept", "application/json");
                if let Some(body) = body {
                    builder = builder.json(body);
                }
                let path = path.to_string();

                async move {
                    let response = builder.send().await.map_err(RemoteError::from)?;
                    let status = response.status();

                    if status == StatusCode::NOT_FOUND {
                        return Err(RemoteError::NotFound(path));
                    }
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        tracing::error!(
                            operation,
                            status = status.as_u16(),
                            body = %body,
                            "Square API error"
                        );
                        return Err(RemoteError::Api {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    response
                        .json::<T>()
                        .await
                        .map_err(|e| RemoteError::Decode(e.to_string()))
                }
            })
            .await
    }
}

#[async_trait]
impl PaymentGateway for SquareClient {
    async fn create_customer(&self, customer: &NewCustomer) -> RemoteResult<RemoteCustomer> {
        let body = json!({
            "idempotency_key": customer.idempotency_key,
            "email_address": customer.email,
            "given_name": customer.given_name.clone().unwrap_or_default(),
            "family_name": customer.family_name.clone().unwrap_or_default(),
            "reference_id": customer.reference_id,
        });
        let env: CustomerEnvelope = self
            .request("create_customer", Method::POST, "/v2/customers", Some(&body))
            .await?;
        Ok(env.customer)
    }

    async fn get_customer(&self, customer_id: &str) -> RemoteResult<RemoteCustomer> {
        let env: CustomerEnvelope = self
            .request(
                "get_customer",
                Method::GET,
                &format!("/v2/customers/{}", customer_id),
                None,
            )
            .await?;
        Ok(env.customer)
    }

    async fn get_subscription_plan(&self, variation_id: &str) -> RemoteResult<CatalogObject> {
        let env: CatalogEnvelope = self
            .request(
                "get_subscription_plan",
                Method::GET,
                &format!("/v2/catalog/object/{}", variation_id),
                None,
            )
            .await?;
        Ok(env.object)
    }

    async fn list_subscription_plans(&self) -> RemoteResult<Vec<CatalogObject>> {
        let env: CatalogListEnvelope = self
            .request(
                "list_subscription_plans",
                Method::GET,
                "/v2/catalog/list?types=SUBSCRIPTION_PLAN",
                None,
            )
            .await?;
        Ok(env.objects)
    }

    async fn create_order(&self, order: &NewDraftOrder) -> RemoteResult<RemoteOrder> {
        let body = json!({
            "idempotency_key": order.idempotency_key,
            "order": {
                "location_id": order.location_id,
                "state": "DRAFT",
                "line_items": [ad_hoc_line_item(&order.line_item)],
            }
        });
        let env: OrderEnvelope = self
            .request("create_order", Method::POST, "/v2/orders", Some(&body))
            .await?;
        Ok(env.order)
    }

    async fn get_order(&self, order_id: &str) -> RemoteResult<RemoteOrder> {
        let env: OrderEnvelope = self
            .request(
                "get_order",
                Method::GET,
                &format!("/v2/orders/{}", order_id),
                None,
            )
            .await?;
        Ok(env.order)
    }

    async fn get_payment(&self, payment_id: &str) -> RemoteResult<RemotePayment> {
        let env: PaymentEnvelope = self
            .request(
                "get_payment",
                Method::GET,
                &format!("/v2/payments/{}", payment_id),
                None,
            )
            .await?;
        Ok(env.payment)
    }

    async fn create_subscription(&self, sub: &NewSubscription) -> RemoteResult<RemoteSubscription> {
        let mut body = json!({
            "idempotency_key": sub.idempotency_key,
            "location_id": sub.location_id,
            "plan_variation_id": sub.plan_variation_id,
            "customer_id": sub.customer_id,
        });
        if let Some(template_id) = &sub.order_template_id {
            body["phases"] = json!([{ "ordinal": 0, "order_template_id": template_id }]);
        }
        if let Some(card_id) = &sub.card_id {
            body["card_id"] = json!(card_id);
        }

        let env: SubscriptionEnvelope = self
            .request(
                "create_subscription",
                Method::POST,
                "/v2/subscriptions",
                Some(&body),
            )
            .await?;
        Ok(env.subscription)
    }

    async fn get_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription> {
        let env: SubscriptionEnvelope = self
            .request(
                "get_subscription",
                Method::GET,
                &format!("/v2/subscriptions/{}", subscription_id),
                None,
            )
            .await?;
        Ok(env.subscription)
    }

    async fn update_subscription_card(
        &self,
        subscription_id: &str,
        card_id: &str,
    ) -> RemoteResult<RemoteSubscription> {
        let body = json!({ "subscription": { "card_id": card_id } });
        let env: SubscriptionEnvelope = self
            .request(
                "update_subscription",
                Method::PUT,
                &format!("/v2/subscriptions/{}", subscription_id),
                Some(&body),
            )
            .await?;
        Ok(env.subscription)
    }

    async fn pause_subscription(
        &self,
        subscription_id: &str,
        pause_cycle_duration: Option<i64>,
    ) -> RemoteResult<RemoteSubscription> {
        let mut body = json!({ "pause_effective_date": today_iso() });
        if let Some(cycles) = pause_cycle_duration {
            body["pause_cycle_duration"] = json!(cycles);
        }
        let env: SubscriptionEnvelope = self
            .request(
                "pause_subscription",
                Method::POST,
                &format!("/v2/subscriptions/{}/pause", subscription_id),
                Some(&body),
            )
            .await?;
        Ok(env.subscription)
    }

    async fn resume_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription> {
        let body = json!({ "resume_effective_date": today_iso() });
        let env: SubscriptionEnvelope = self
            .request(
                "resume_subscription",
                Method::POST,
                &format!("/v2/subscriptions/{}/resume", subscription_id),
                Some(&body),
            )
            .await?;
        Ok(env.subscription)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> RemoteResult<RemoteSubscription> {
        let env: SubscriptionEnvelope = self
            .request(
                "cancel_subscription",
                Method::POST,
                &format!("/v2/subscriptions/{}/cancel", subscription_id),
                Some(&json!({})),
            )
            .await?;
        Ok(env.subscription)
    }

    async fn list_subscription_events(
        &self,
        subscription_id: &str,
    ) -> RemoteResult<Vec<SubscriptionEvent>> {
        let env: SubscriptionEventsEnvelope = self
            .request(
                "list_subscription_events",
                Method::GET,
                &format!("/v2/subscriptions/{}/events", subscription_id),
                None,
            )
            .await?;
        Ok(env.subscription_events)
    }

    async fn create_checkout_session(&self, link: &NewPaymentLink) -> RemoteResult<PaymentLink> {
        let metadata: serde_json::Map<String, Value> = link
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let line_items: Vec<Value> = link
            .line_items
            .iter()
            .map(|item| match item {
                CheckoutLineItem::AdHoc(ad_hoc) => ad_hoc_line_item(ad_hoc),
                CheckoutLineItem::Catalog { variation_id } => json!({
                    "quantity": "1",
                    "catalog_object_id": variation_id,
                }),
            })
            .collect();

        let mut checkout_options = json!({ "allow_tipping": false });
        if let Some(redirect) = &link.redirect_url {
            checkout_options["redirect_url"] = json!(redirect);
        }

        let mut body = json!({
            "idempotency_key": link.idempotency_key,
            "order": {
                "location_id": link.location_id,
                "line_items": line_items,
                "metadata": metadata,
            },
            "checkout_options": checkout_options,
            "payment_options": { "autocomplete": true },
        });
        if let Some(email) = &link.buyer_email {
            body["pre_populated_data"] = json!({ "buyer_email": email });
        }

        let env: PaymentLinkEnvelope = self
            .request(
                "create_checkout_session",
                Method::POST,
                "/v2/online-checkout/payment-links",
                Some(&body),
            )
            .await?;
        Ok(env.payment_link)
    }
}

fn ad_hoc_line_item(item: &AdHocLineItem) -> Value {
    json!({
        "name": item.name,
        "quantity": "1",
        "base_price_money": { "amount": item.amount, "currency": item.currency },
    })
}

fn today_iso() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}
