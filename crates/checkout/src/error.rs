use std::time::Duration;

use thiserror::Error;

use store::StoreError;

/// Errors a checkout attempt can surface to the caller.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The request itself is unacceptable. Never retried.
    #[error("{0}")]
    Validation(String),

    /// A throttle window denied the request.
    #[error("{reason}")]
    Throttled {
        reason: String,
        retry_after: Duration,
    },

    /// A product ran out of stock mid-transaction. The transaction rolled
    /// back; no charge occurred.
    #[error("Insufficient stock for {product_name}: requested {requested}, available {available}")]
    StockConflict {
        product_name: String,
        requested: u32,
        available: i64,
    },

    /// The gateway declined the charge. Terminal for this attempt.
    #[error("Payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// Every retry failed; the charge did not go through.
    #[error("Payment failed after {attempts} attempts")]
    PaymentFailed { attempts: u32 },

    /// The circuit is open; no gateway call was made.
    #[error("Payment service unavailable, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Storage failure unrelated to stock contention.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CheckoutError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::StockConflict {
                product_name,
                requested,
                available,
                ..
            } => CheckoutError::StockConflict {
                product_name,
                requested,
                available,
            },
            other => CheckoutError::Store(other),
        }
    }
}
