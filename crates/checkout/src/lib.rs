//! Checkout-time gating and orchestration.
//!
//! [`Throttle`] bounds request volume per identity, product, and system;
//! [`CheckoutRequest`] validation rejects bad input before any shared state
//! is touched; and [`CheckoutOrchestrator`] drives the atomic stock
//! transaction plus payment for both the synchronous and the queued flash
//! path.

pub mod error;
pub mod orchestrator;
pub mod request;
pub mod throttle;

pub use error::CheckoutError;
pub use orchestrator::{CheckoutConfig, CheckoutOrchestrator, CheckoutReceipt, QueuedCheckout};
pub use request::{CheckoutRequest, RequestLine};
pub use throttle::{
    Throttle, ThrottleConfig, ThrottleDecision, ThrottleDenial, ThrottleStatus, WindowLimit,
};
