//! Application state

use std::sync::Arc;

use rise_billing::BillingService;
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    error::{ApiError, ApiResult},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// None when Square is not configured; billing routes answer 503
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = match BillingService::from_env(pool.clone()) {
            Ok(svc) => {
                tracing::info!("Square billing service initialized");
                Some(Arc::new(svc))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Square billing not configured");
                None
            }
        };

        Self::with_billing(pool, config, billing)
    }

    pub fn with_billing(
        pool: PgPool,
        config: Config,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret),
            pool,
            config,
            billing,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing
            .as_deref()
            .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".to_string()))
    }
}
