//! Checkout routes

use axum::{
    extract::{Extension, State},
    Json,
};
use rise_billing::{
    EventCheckoutRequest, EventCheckoutResponse, SubscriptionCheckoutRequest,
    SubscriptionCheckoutResponse,
};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// POST /subscriptions/checkout
pub async fn create_subscription_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SubscriptionCheckoutRequest>,
) -> ApiResult<Json<SubscriptionCheckoutResponse>> {
    let billing = state.billing()?;

    tracing::info!(
        user_id = %auth_user.user_id,
        plan_id = %req.membership_plan_id,
        "Subscription checkout requested"
    );

    let response = billing
        .checkout
        .create_subscription_checkout(auth_user.user_id, &req)
        .await?;
    Ok(Json(response))
}

/// POST /checkout/event
pub async fn create_event_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<EventCheckoutRequest>,
) -> ApiResult<Json<EventCheckoutResponse>> {
    let billing = state.billing()?;

    let response = billing
        .checkout
        .create_event_checkout(auth_user.user_id, req.event_id)
        .await?;
    Ok(Json(response))
}
