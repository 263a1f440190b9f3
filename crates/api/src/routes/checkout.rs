//! Checkout endpoints, synchronous and queued.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use checkout::{CheckoutOrchestrator, CheckoutRequest};
use common::SaleId;
use resilience::PaymentGateway;
use serde::Serialize;
use store::{KeyValueStore, Store};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S, K, G> {
    pub orchestrator: CheckoutOrchestrator<S, K, G>,
}

// -- Response types --

#[derive(Serialize)]
pub struct FlashCheckoutResponse {
    pub status: &'static str,
    pub reference: SaleId,
    pub message: &'static str,
    pub job_id: String,
    pub sync_duration_ms: f64,
    pub idempotency_key: String,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub status: &'static str,
    pub reference: SaleId,
    pub provider_ref: String,
    pub attempts: u32,
    pub total_cents: i64,
}

/// Throttle identity: the authenticated user if present, else the
/// forwarded client address, else a shared anonymous bucket.
fn identity(request: &CheckoutRequest, headers: &HeaderMap) -> String {
    if let Some(user_id) = request.user_id {
        return user_id.to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// -- Handlers --

/// POST /flash-checkout — reserve stock and queue finalization.
#[tracing::instrument(skip_all)]
pub async fn flash<S, K, G>(
    State(state): State<Arc<AppState<S, K, G>>>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<FlashCheckoutResponse>, ApiError>
where
    S: Store + 'static,
    K: KeyValueStore + 'static,
    G: PaymentGateway + 'static,
{
    let identity = identity(&request, &headers);
    let key = idempotency_key(&headers);
    let queued = state
        .orchestrator
        .flash_checkout(&identity, request, key)
        .await?;

    Ok(Json(FlashCheckoutResponse {
        status: "queued",
        reference: queued.sale_id,
        message: "Your order is being finalized. You will receive confirmation shortly.",
        job_id: queued.job_id.to_string(),
        sync_duration_ms: queued.sync_duration_ms,
        idempotency_key: queued.idempotency_key,
    }))
}

/// POST /checkout — charge inline and settle before responding.
#[tracing::instrument(skip_all)]
pub async fn checkout<S, K, G>(
    State(state): State<Arc<AppState<S, K, G>>>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError>
where
    S: Store + 'static,
    K: KeyValueStore + 'static,
    G: PaymentGateway + 'static,
{
    let identity = identity(&request, &headers);
    let receipt = state.orchestrator.checkout(&identity, request).await?;

    Ok(Json(CheckoutResponse {
        status: "ok",
        reference: receipt.sale_id,
        provider_ref: receipt.provider_ref,
        attempts: receipt.attempts,
        total_cents: receipt.total.cents(),
    }))
}
