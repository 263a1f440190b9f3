//! API error types with HTTP response mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use checkout::CheckoutError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// Any checkout-path failure.
    Checkout(CheckoutError),
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}

/// Whole seconds for a `Retry-After` header, rounded up so a client that
/// waits exactly this long lands past the window.
fn retry_after_secs(retry_after: std::time::Duration) -> u64 {
    retry_after.as_secs_f64().ceil() as u64
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, status_label, message, retry_after) = match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "error", message, None)
            }
            ApiError::Checkout(err) => match err {
                CheckoutError::Validation(message) => {
                    (StatusCode::BAD_REQUEST, "error", message, None)
                }
                CheckoutError::Throttled {
                    reason,
                    retry_after,
                } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "throttled",
                    reason,
                    Some(retry_after),
                ),
                CheckoutError::StockConflict { product_name, .. } => (
                    StatusCode::CONFLICT,
                    "error",
                    format!(
                        "Sorry, another customer just purchased the last of '{product_name}'. \
                         Please try again."
                    ),
                    None,
                ),
                err @ CheckoutError::PaymentDeclined { .. } => (
                    StatusCode::PAYMENT_REQUIRED,
                    "error",
                    err.to_string(),
                    None,
                ),
                err @ CheckoutError::PaymentFailed { .. } => {
                    (StatusCode::BAD_GATEWAY, "error", err.to_string(), None)
                }
                CheckoutError::CircuitOpen { retry_after } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "error",
                    "Payment service is temporarily unavailable. Please try again shortly."
                        .to_string(),
                    Some(retry_after),
                ),
                CheckoutError::Store(err) => {
                    tracing::error!(error = %err, "storage error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "error",
                        "Internal server error".to_string(),
                        None,
                    )
                }
            },
        };

        let body = serde_json::json!({ "status": status_label, "message": message });
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(retry_after) = retry_after
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs(retry_after).to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
