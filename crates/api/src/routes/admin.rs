//! Admin routes
//!
//! Protected by `require_admin`. Sync and replay run in background tasks and
//! never report their failures to the caller.

use axum::{
    extract::{Extension, State},
    Json,
};
use rise_billing::{
    AutoChargingReport, AutoChargingRetrySummary, PaymentGateway, PlanSummary, SyncStatusReport,
};
use serde::Serialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct TriggeredResponse {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ExpireResponse {
    pub expired: u64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionPlansResponse {
    pub subscription_plans: Vec<PlanSummary>,
    pub total_count: usize,
}

/// POST /admin/sync/force
pub async fn force_full_sync(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<TriggeredResponse>> {
    let sync = state.billing()?.sync.clone();
    tracing::info!(admin_id = %auth_user.user_id, "Full sync triggered manually");

    tokio::spawn(async move {
        if let Err(e) = sync.run_full_sync().await {
            tracing::error!(error = %e, "Manual full sync failed");
        }
    });

    Ok(Json(TriggeredResponse {
        status: "sync_triggered",
        message: "Full sync started in background",
    }))
}

/// POST /admin/webhooks/retry
pub async fn retry_failed_webhooks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<TriggeredResponse>> {
    let webhooks = state.billing()?.webhooks.clone();
    tracing::info!(admin_id = %auth_user.user_id, "Webhook replay triggered manually");

    tokio::spawn(async move {
        if let Err(e) = webhooks.replay_failed().await {
            tracing::error!(error = %e, "Manual webhook replay failed");
        }
    });

    Ok(Json(TriggeredResponse {
        status: "retry_triggered",
        message: "Failed webhook processing started",
    }))
}

/// GET /admin/sync/status
pub async fn sync_status(State(state): State<AppState>) -> ApiResult<Json<SyncStatusReport>> {
    let report = state.billing()?.sync.status().await?;
    Ok(Json(report))
}

/// POST /admin/memberships/expire
pub async fn expire_memberships(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ExpireResponse>> {
    let expired = state.billing()?.subscriptions.expire_memberships().await?;
    tracing::info!(admin_id = %auth_user.user_id, expired = expired, "Memberships expired");
    Ok(Json(ExpireResponse { expired }))
}

/// GET /admin/auto-charging/status
pub async fn auto_charging_status(
    State(state): State<AppState>,
) -> ApiResult<Json<AutoChargingReport>> {
    let report = state.billing()?.auto_charging.status_report().await?;
    Ok(Json(report))
}

/// POST /admin/auto-charging/retry
pub async fn retry_auto_charging(
    State(state): State<AppState>,
) -> ApiResult<Json<AutoChargingRetrySummary>> {
    let summary = state.billing()?.auto_charging.retry_failed().await?;
    Ok(Json(summary))
}

/// GET /admin/square/subscription-plans
pub async fn list_subscription_plans(
    State(state): State<AppState>,
) -> ApiResult<Json<SubscriptionPlansResponse>> {
    let objects = state
        .billing()?
        .gateway
        .list_subscription_plans()
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;

    let plans = PlanSummary::from_catalog(&objects);
    tracing::info!(count = plans.len(), "Retrieved Square subscription plans");

    Ok(Json(SubscriptionPlansResponse {
        total_count: plans.len(),
        subscription_plans: plans,
    }))
}
