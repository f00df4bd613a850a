//! API routes

pub mod admin;
pub mod checkout;
pub mod health;
pub mod subscriptions;
pub mod webhook;


use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Public routes (no auth; the webhook carries a Square signature instead)
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/webhook", post(webhook::handle_webhook));

    // Admin routes (require_auth runs first, then require_admin)
    let admin_routes = Router::new()
        .route("/admin/sync/force", post(admin::force_full_sync))
        .route("/admin/sync/status", get(admin::sync_status))
        .route("/admin/webhooks/retry", post(admin::retry_failed_webhooks))
        .route("/admin/memberships/expire", post(admin::expire_memberships))
        .route(
            "/admin/auto-charging/status",
            get(admin::auto_charging_status),
        )
        .route("/admin/auto-charging/retry", post(admin::retry_auto_charging))
        .route(
            "/admin/square/subscription-plans",
            get(admin::list_subscription_plans),
        )
        .layer(middleware::from_fn(require_admin));

    let protected_routes = Router::new()
        .route(
            "/subscriptions/checkout",
            post(checkout::create_subscription_checkout),
        )
        .route("/checkout/event", post(checkout::create_event_checkout))
        .route(
            "/subscriptions/{id}",
            get(subscriptions::get_subscription),
        )
        .route(
            "/subscriptions/{id}/manage",
            post(subscriptions::manage_subscription),
        )
        .route(
            "/subscriptions/{id}/sync-billing",
            post(subscriptions::sync_billing),
        )
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
