//! Resilience patterns guarding calls to the external payment dependency.
//!
//! [`CircuitBreaker`] fails fast once the gateway is known-bad,
//! [`RetryPolicy`] bounds how hard a single call is retried, and
//! [`ResilientPaymentService`] composes both around a [`PaymentGateway`].

pub mod breaker;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod service;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::GatewayError;
pub use gateway::{ChargeApproval, PaymentGateway, ScriptedGateway, SimulatedGateway};
pub use retry::RetryPolicy;
pub use service::{ChargeOutcome, ResilientPaymentService, VoidOutcome};
