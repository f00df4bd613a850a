//! Square configuration loaded from the environment

use crate::error::{BillingError, BillingResult};

const SANDBOX_BASE_URL: &str = "https://connect.squareupsandbox.com";
const PRODUCTION_BASE_URL: &str = "https://connect.squareup.com";
const DEFAULT_API_VERSION: &str = "2025-07-16";
const DEFAULT_DELINQUENCY_EVENTS: &str = "invoice.scheduled_charge_failed,invoice.failed";

/// Square environment selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquareEnvironment {
    Sandbox,
    Production,
}

impl SquareEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            SquareEnvironment::Sandbox => SANDBOX_BASE_URL,
            SquareEnvironment::Production => PRODUCTION_BASE_URL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub access_token: String,
    pub location_id: String,
    pub environment: SquareEnvironment,
    /// Overrides the environment URL (used against mock servers)
    pub base_url: String,
    pub api_version: String,
    /// HMAC key Square signs webhook deliveries with
    pub webhook_signature_key: Option<String>,
    /// Exact callback URL registered with Square, part of the signed payload
    pub webhook_url: String,
    pub frontend_url: String,
    pub currency: String,
    /// Event types that mark a subscription delinquent
    pub delinquency_events: Vec<String>,
}

impl SquareConfig {
    pub fn from_env() -> BillingResult<Self> {
        let access_token = std::env::var("SQUARE_ACCESS_TOKEN")
            .map_err(|_| BillingError::Config("SQUARE_ACCESS_TOKEN not set".to_string()))?;
        let location_id = std::env::var("SQUARE_LOCATION_ID")
            .map_err(|_| BillingError::Config("SQUARE_LOCATION_ID not set".to_string()))?;

        let environment = match std::env::var("SQUARE_ENV").as_deref() {
            Ok("production") => SquareEnvironment::Production,
            _ => SquareEnvironment::Sandbox,
        };

        let webhook_signature_key = std::env::var("SQUARE_WEBHOOK_SIGNATURE_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if webhook_signature_key.is_none() {
            tracing::warn!("SQUARE_WEBHOOK_SIGNATURE_KEY not set - all webhooks will be rejected");
        }

        let delinquency_events = parse_event_list(
            &std::env::var("SQUARE_DELINQUENCY_EVENTS")
                .unwrap_or_else(|_| DEFAULT_DELINQUENCY_EVENTS.to_string()),
        );

        Ok(Self {
            access_token,
            location_id,
            environment,
            base_url: std::env::var("SQUARE_BASE_URL")
                .unwrap_or_else(|_| environment.base_url().to_string()),
            api_version: std::env::var("SQUARE_VERSION")
                .unwrap_or_else(|_| DEFAULT_API_VERSION.to_string()),
            webhook_signature_key,
            webhook_url: std::env::var("SQUARE_WEBHOOK_URL").unwrap_or_default(),
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            currency: std::env::var("SQUARE_CURRENCY").unwrap_or_else(|_| "CAD".to_string()),
            delinquency_events,
        })
    }

    /// Config pointed at an arbitrary base URL, for tests against mock servers
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            access_token: "test-token".to_string(),
            location_id: "LOC123".to_string(),
            environment: SquareEnvironment::Sandbox,
            base_url: base_url.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            webhook_signature_key: None,
            webhook_url: String::new(),
            frontend_url: "http://localhost:3000".to_string(),
            currency: "CAD".to_string(),
            delinquency_events: parse_event_list(DEFAULT_DELINQUENCY_EVENTS),
        }
    }
}

fn parse_event_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
