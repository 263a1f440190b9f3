use std::time::Duration;

use thiserror::Error;

/// Errors returned by a payment gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The gateway did not answer within the request timeout.
    #[error("Payment gateway timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The gateway answered with a server-side (5xx-equivalent) failure.
    #[error("Payment gateway error: HTTP {code}")]
    Server { code: u16 },

    /// The charge was declined. Terminal; retrying will not help.
    #[error("Payment declined: {reason}")]
    Declined { reason: String },

    /// The request itself was malformed (4xx-equivalent). Terminal.
    #[error("Invalid payment request: {reason}")]
    InvalidRequest { reason: String },
}

impl GatewayError {
    /// Whether the error class is worth retrying. Timeouts and server-side
    /// failures are transient; declines and malformed requests are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::Server { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(
            GatewayError::Timeout {
                timeout: Duration::from_secs(2)
            }
            .is_retryable()
        );
        assert!(GatewayError::Server { code: 503 }.is_retryable());
        assert!(
            !GatewayError::Declined {
                reason: "Insufficient funds".to_string()
            }
            .is_retryable()
        );
        assert!(
            !GatewayError::InvalidRequest {
                reason: "bad card".to_string()
            }
            .is_retryable()
        );
    }
}
