//! The transactional checkout entry point.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{JobId, Money, SaleId};
use resilience::{ChargeOutcome, PaymentGateway, ResilientPaymentService};
use store::{
    CartLine, FinalizePayload, JOB_FINALIZE_FLASH_ORDER, KeyValueStore, NewCheckout,
    PaymentMethod, PaymentOutcome, ReleaseReason, Store, StoreError,
};

use crate::{CheckoutError, CheckoutRequest, RequestLine, Throttle, ThrottleDecision};

/// Knobs for both checkout paths.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// How long a reservation holds stock before the sweep reclaims it.
    pub reservation_ttl: Duration,
    /// How long an idempotency record shields duplicate submissions.
    pub idempotency_ttl: Duration,
    /// Feature flag for the queued flash path.
    pub flash_enabled: bool,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(15 * 60),
            idempotency_ttl: Duration::from_secs(300),
            flash_enabled: true,
        }
    }
}

/// Accepted flash checkout: the sale exists, stock is held, and a
/// finalization job is queued. This exact payload is cached under the
/// idempotency key so duplicates replay it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCheckout {
    pub sale_id: SaleId,
    pub job_id: JobId,
    pub sync_duration_ms: f64,
    pub idempotency_key: String,
}

/// Completed synchronous checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutReceipt {
    pub sale_id: SaleId,
    pub provider_ref: String,
    pub attempts: u32,
    pub total: Money,
}

/// Reference cash payments carry instead of a gateway transaction id.
const CASH_REFERENCE: &str = "CASH-LOCAL";

/// Orchestrates validation, throttling, the atomic stock transaction, and
/// payment for both checkout paths.
///
/// Both paths share the same transactional core: lock product rows, verify
/// stock, decrement, and write the sale, payment, item, and reservation
/// rows together. The synchronous path then charges inline and settles the
/// reservations itself; the flash path enqueues a job and leaves settlement
/// to the worker.
pub struct CheckoutOrchestrator<S, K, G> {
    store: S,
    kv: K,
    payments: ResilientPaymentService<G, K>,
    throttle: Throttle<K>,
    config: CheckoutConfig,
}

impl<S, K, G> CheckoutOrchestrator<S, K, G>
where
    S: Store,
    K: KeyValueStore,
    G: PaymentGateway,
{
    pub fn new(
        store: S,
        kv: K,
        payments: ResilientPaymentService<G, K>,
        throttle: Throttle<K>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            store,
            kv,
            payments,
            throttle,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn payments(&self) -> &ResilientPaymentService<G, K> {
        &self.payments
    }

    pub fn throttle(&self) -> &Throttle<K> {
        &self.throttle
    }

    fn idempotency_cache_key(key: &str) -> String {
        format!("flash_checkout_{key}")
    }

    async fn check_throttle(
        &self,
        identity: &str,
        lines: &[RequestLine],
    ) -> Result<(), CheckoutError> {
        for line in lines {
            if let ThrottleDecision::Denied(denial) =
                self.throttle.allow(identity, Some(&line.product_id)).await?
            {
                tracing::info!(
                    identity,
                    product_id = %line.product_id,
                    retry_after = ?denial.retry_after,
                    "checkout throttled"
                );
                return Err(CheckoutError::Throttled {
                    reason: denial.reason,
                    retry_after: denial.retry_after,
                });
            }
        }
        Ok(())
    }

    /// Resolves each requested line against the catalog at its current
    /// effective price. Unknown or inactive products fail validation.
    async fn price_lines(&self, lines: &[RequestLine]) -> Result<Vec<CartLine>, CheckoutError> {
        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            let product = self
                .store
                .get_product(&line.product_id)
                .await?
                .filter(|p| p.active)
                .ok_or_else(|| {
                    CheckoutError::Validation(format!(
                        "Product {} is not available for purchase",
                        line.product_id
                    ))
                })?;
            priced.push(CartLine {
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                unit_price: product.price,
            });
        }
        Ok(priced)
    }

    async fn reserve(
        &self,
        request: &CheckoutRequest,
        lines: Vec<CartLine>,
    ) -> Result<(SaleId, Money), CheckoutError> {
        let total: Money = lines.iter().map(CartLine::line_total).sum();
        let sale_id = SaleId::new();
        self.store
            .create_checkout(NewCheckout {
                sale_id,
                user_id: request.user_id,
                address: request.address.trim().to_string(),
                method: request.payment_method,
                total,
                lines,
                expires_at: Utc::now() + self.config.reservation_ttl,
            })
            .await?;
        Ok((sale_id, total))
    }

    /// Queued flash checkout: reserve stock now, pay later.
    #[tracing::instrument(skip(self, request, idempotency_key))]
    pub async fn flash_checkout(
        &self,
        identity: &str,
        request: CheckoutRequest,
        idempotency_key: Option<String>,
    ) -> Result<QueuedCheckout, CheckoutError> {
        if !self.config.flash_enabled {
            return Err(CheckoutError::Validation(
                "Flash sale is not currently enabled".to_string(),
            ));
        }

        let started = std::time::Instant::now();
        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let cache_key = Self::idempotency_cache_key(&key);

        if let Some(cached) = self.kv.get(&cache_key).await? {
            let replay: QueuedCheckout =
                serde_json::from_value(cached).map_err(StoreError::from)?;
            tracing::info!(
                identity,
                idempotency_key = %key,
                sale_id = %replay.sale_id,
                "duplicate flash checkout replayed from idempotency cache"
            );
            metrics::counter!("flash_checkout_idempotent_replays_total").increment(1);
            return Ok(replay);
        }

        request.validate()?;
        self.check_throttle(identity, &request.lines).await?;
        let lines = self.price_lines(&request.lines).await?;
        let (sale_id, total) = self.reserve(&request, lines).await?;

        let payload = serde_json::to_value(FinalizePayload {
            sale_id,
            method: request.payment_method,
            amount: total,
        })
        .map_err(StoreError::from)?;
        let job = self
            .store
            .enqueue_job(JOB_FINALIZE_FLASH_ORDER, payload)
            .await?;

        let response = QueuedCheckout {
            sale_id,
            job_id: job.id,
            sync_duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            idempotency_key: key.clone(),
        };
        self.kv
            .set(
                &cache_key,
                serde_json::to_value(&response).map_err(StoreError::from)?,
                Some(self.config.idempotency_ttl),
            )
            .await?;

        tracing::info!(
            identity,
            sale_id = %sale_id,
            job_id = %job.id,
            sync_duration_ms = response.sync_duration_ms,
            "flash checkout queued"
        );
        metrics::counter!("flash_checkouts_queued_total").increment(1);
        metrics::histogram!("flash_checkout_sync_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok(response)
    }

    /// Synchronous checkout: reserve stock and charge inline, settling the
    /// reservations before returning.
    #[tracing::instrument(skip(self, request))]
    pub async fn checkout(
        &self,
        identity: &str,
        request: CheckoutRequest,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        request.validate()?;
        self.check_throttle(identity, &request.lines).await?;
        let lines = self.price_lines(&request.lines).await?;
        let (sale_id, total) = self.reserve(&request, lines).await?;

        if request.payment_method == PaymentMethod::Cash {
            self.store
                .record_payment_outcome(
                    sale_id,
                    PaymentOutcome::Completed {
                        provider_ref: CASH_REFERENCE.to_string(),
                    },
                )
                .await?;
            self.store.commit_reservations(sale_id).await?;
            return Ok(CheckoutReceipt {
                sale_id,
                provider_ref: CASH_REFERENCE.to_string(),
                attempts: 0,
                total,
            });
        }

        match self.payments.charge_with_resilience(sale_id, total).await? {
            ChargeOutcome::Ok {
                provider_ref,
                attempts,
                ..
            } => {
                self.store
                    .record_payment_outcome(
                        sale_id,
                        PaymentOutcome::Completed {
                            provider_ref: provider_ref.clone(),
                        },
                    )
                    .await?;
                self.store.commit_reservations(sale_id).await?;
                Ok(CheckoutReceipt {
                    sale_id,
                    provider_ref,
                    attempts,
                    total,
                })
            }
            ChargeOutcome::Failed {
                attempts,
                last_error,
            } => {
                self.store
                    .record_payment_outcome(sale_id, PaymentOutcome::Failed)
                    .await?;
                self.store
                    .release_reservations(sale_id, ReleaseReason::PaymentFailed)
                    .await?;
                if last_error.is_retryable() {
                    Err(CheckoutError::PaymentFailed { attempts })
                } else {
                    Err(CheckoutError::PaymentDeclined {
                        reason: last_error.to_string(),
                    })
                }
            }
            ChargeOutcome::Unavailable { retry_after } => {
                self.store
                    .record_payment_outcome(sale_id, PaymentOutcome::Failed)
                    .await?;
                self.store
                    .release_reservations(sale_id, ReleaseReason::PaymentFailed)
                    .await?;
                Err(CheckoutError::CircuitOpen { retry_after })
            }
        }
    }
}
