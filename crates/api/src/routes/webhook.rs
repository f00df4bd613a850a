//! Square webhook receiver

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use rise_billing::{WebhookAck, SIGNATURE_HEADER};
use serde::Serialize;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: WebhookAck,
}

/// POST /webhook
///
/// The raw body is needed for signature verification, so it is taken as
/// bytes. Anything past verification and parsing is acknowledged with 200.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let billing = state.billing()?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let status = billing.webhooks.handle(signature, &body).await?;
    Ok(Json(WebhookResponse { status }))
}
