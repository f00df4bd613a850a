//! Subscription management routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use rise_billing::{
    BillingSyncResponse, ManageSubscriptionRequest, ManageSubscriptionResponse,
    SubscriptionDetails,
};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// POST /subscriptions/{id}/manage
pub async fn manage_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
    Json(req): Json<ManageSubscriptionRequest>,
) -> ApiResult<Json<ManageSubscriptionResponse>> {
    let billing = state.billing()?;
    let response = billing
        .subscriptions
        .manage(auth_user.user_id, &subscription_id, &req)
        .await?;
    Ok(Json(response))
}

/// GET /subscriptions/{id}
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
) -> ApiResult<Json<SubscriptionDetails>> {
    let billing = state.billing()?;
    let details = billing
        .subscriptions
        .details(auth_user.user_id, &subscription_id)
        .await?;
    Ok(Json(details))
}

/// POST /subscriptions/{id}/sync-billing
pub async fn sync_billing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
) -> ApiResult<Json<BillingSyncResponse>> {
    let billing = state.billing()?;
    let response = billing
        .subscriptions
        .sync_billing(auth_user.user_id, &subscription_id)
        .await?;
    Ok(Json(response))
}
