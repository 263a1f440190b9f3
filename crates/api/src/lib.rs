//! HTTP API server for the flash-sale checkout core.
//!
//! Exposes the synchronous `POST /checkout` and queued `POST /flash-checkout`
//! paths, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use checkout::{CheckoutOrchestrator, Throttle};
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{
    CircuitBreaker, PaymentGateway, ResilientPaymentService, SimulatedGateway,
};
use store::{InMemoryKeyValueStore, InMemoryStore, KeyValueStore, Store};
use worker::QueueWorker;

pub use config::Config;
use routes::checkout::AppState;

/// Name under which the payment breaker's state lives in the counter store.
/// The API and the worker use the same name, so they share one circuit.
const PAYMENT_BREAKER: &str = "payment_gateway";

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, K, G>(
    state: Arc<AppState<S, K, G>>,
    metrics_handle: PrometheusHandle,
) -> Router
where
    S: Store + 'static,
    K: KeyValueStore + 'static,
    G: PaymentGateway + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/checkout", post(routes::checkout::checkout::<S, K, G>))
        .route("/flash-checkout", post(routes::checkout::flash::<S, K, G>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Default in-memory wiring: shared stores, a simulated gateway, and a
/// worker that sees the same state as the request handlers.
pub fn create_default_state(
    config: &Config,
) -> (
    Arc<AppState<InMemoryStore, InMemoryKeyValueStore, Arc<SimulatedGateway>>>,
    QueueWorker<InMemoryStore, InMemoryKeyValueStore, Arc<SimulatedGateway>>,
) {
    let store = InMemoryStore::new();
    let kv = InMemoryKeyValueStore::new();
    let gateway = Arc::new(SimulatedGateway::default());

    let api_payments = ResilientPaymentService::new(
        gateway.clone(),
        CircuitBreaker::new(PAYMENT_BREAKER, kv.clone(), config.breaker_config()),
        config.retry_policy(),
        config.payment_timeout(),
    );
    let worker_payments = ResilientPaymentService::new(
        gateway,
        CircuitBreaker::new(PAYMENT_BREAKER, kv.clone(), config.breaker_config()),
        config.retry_policy(),
        config.payment_timeout(),
    );

    let orchestrator = CheckoutOrchestrator::new(
        store.clone(),
        kv.clone(),
        api_payments,
        Throttle::new(kv, config.throttle_config()),
        config.checkout_config(),
    );
    let worker = QueueWorker::new(store, worker_payments, config.worker_config());

    (Arc::new(AppState { orchestrator }), worker)
}
