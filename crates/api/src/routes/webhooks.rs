//! Webhook receiving endpoint
//!
//! The processor signs each delivery; verification failure is a 401 and the
//! delivery is not recorded. Everything past the signature check answers
//! 200 so the processor stops redelivering: duplicates, unhandled event
//! types, and dispatch failures (those are recorded in the idempotency
//! ledger with the error for operator follow-up).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;

use boatyard_billing::{ProcessorType, WebhookDisposition};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(processor): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let requested = ProcessorType::from_str(&processor)
        .ok_or_else(|| ApiError::not_found(format!("unknown processor: {processor}")))?;
    if requested != state.billing.webhooks.processor_type() {
        return Err(ApiError::not_found(format!(
            "no webhook endpoint for processor: {processor}"
        )));
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing webhook signature header"))?;

    let disposition = state.billing.webhooks.handle_webhook(&body, signature).await?;

    let response = match disposition {
        WebhookDisposition::Processed { .. } => json!({ "received": true }),
        WebhookDisposition::Duplicate => json!({ "received": true, "duplicate": true }),
        WebhookDisposition::Unhandled { event_type } => {
            json!({ "received": true, "unhandled": event_type })
        }
        WebhookDisposition::DispatchFailed { error } => {
            tracing::warn!(processor = %processor, error = %error, "Webhook dispatch failed");
            json!({ "received": true })
        }
    };
    Ok(Json(response))
}
