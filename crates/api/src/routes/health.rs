//! Health check

use axum::{extract::State, Json};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub active_subscriptions: Option<i64>,
    pub square_api_version: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Health check failed");
            ApiError::ServiceUnavailable("Database unreachable".to_string())
        })?;

    let (active_subscriptions, square_api_version) = match &state.billing {
        Some(billing) => (
            Some(billing.active_subscription_count().await?),
            Some(billing.square_version.clone()),
        ),
        None => (None, None),
    };

    Ok(Json(HealthResponse {
        status: "healthy",
        service: "rise-square-payment",
        timestamp: OffsetDateTime::now_utc(),
        active_subscriptions,
        square_api_version,
    }))
}
