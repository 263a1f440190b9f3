//! Background worker for the queued checkout path.
//!
//! [`QueueWorker`] polls the persistent job queue, finalizes flash orders
//! (charge, then commit or release the stock reservations), and periodically
//! sweeps expired reservations back into sellable stock.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;

use resilience::{ChargeOutcome, PaymentGateway, ResilientPaymentService};
use store::{
    FinalizePayload, JOB_FINALIZE_FLASH_ORDER, JobRecord, KeyValueStore, PaymentMethod,
    PaymentOutcome, ReleaseReason, Store, StoreError,
};

/// Reference cash payments carry instead of a gateway transaction id.
const CASH_REFERENCE: &str = "CASH-LOCAL";

/// Worker loop timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for pending jobs when the queue is empty.
    pub poll_interval: Duration,
    /// How often to sweep expired reservations.
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Polls the job queue and finalizes queued checkouts.
///
/// A payment that fails after all retries is a handled outcome: the sale is
/// marked FAILED, its reservations are released, and the job completes.
/// Only unexpected errors (storage failures, bad payloads) mark the job
/// FAILED, after a best-effort reservation release.
pub struct QueueWorker<S, K, G> {
    store: S,
    payments: ResilientPaymentService<G, K>,
    config: WorkerConfig,
}

impl<S, K, G> QueueWorker<S, K, G>
where
    S: Store,
    K: KeyValueStore,
    G: PaymentGateway,
{
    pub fn new(store: S, payments: ResilientPaymentService<G, K>, config: WorkerConfig) -> Self {
        Self {
            store,
            payments,
            config,
        }
    }

    /// Runs until `shutdown` resolves, draining the queue on each poll tick
    /// and sweeping expired reservations on each sweep tick.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            sweep_interval = ?self.config.sweep_interval,
            "queue worker starting"
        );
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("queue worker shutting down");
                    return;
                }
                _ = sweep.tick() => {
                    if let Err(error) = self.sweep_expired().await {
                        tracing::error!(%error, "expired reservation sweep failed");
                    }
                }
                _ = poll.tick() => {
                    loop {
                        match self.run_once().await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(error) => {
                                tracing::error!(%error, "job processing failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Claims and processes one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> store::Result<bool> {
        let Some(job) = self.store.claim_next_job().await? else {
            return Ok(false);
        };
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "processing job");
        let started = std::time::Instant::now();

        match self.process(&job).await {
            Ok(()) => {
                self.store.complete_job(job.id).await?;
                tracing::info!(
                    job_id = %job.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                metrics::counter!("worker_jobs_completed_total").increment(1);
            }
            Err(error) => {
                tracing::error!(job_id = %job.id, %error, "job failed");
                metrics::counter!("worker_jobs_failed_total").increment(1);

                // Best-effort stock recovery; the TTL sweep is the backstop
                // if this release fails too.
                if let Ok(payload) =
                    serde_json::from_value::<FinalizePayload>(job.payload.clone())
                    && let Err(release_error) = self
                        .store
                        .release_reservations(payload.sale_id, ReleaseReason::ProcessingError)
                        .await
                {
                    tracing::error!(
                        sale_id = %payload.sale_id,
                        error = %release_error,
                        "reservation release after job failure also failed"
                    );
                }
                self.store.fail_job(job.id, &error.to_string()).await?;
            }
        }
        metrics::histogram!("worker_job_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(true)
    }

    async fn process(&self, job: &JobRecord) -> store::Result<()> {
        match job.job_type.as_str() {
            JOB_FINALIZE_FLASH_ORDER => {
                let payload: FinalizePayload = serde_json::from_value(job.payload.clone())?;
                self.finalize(payload).await
            }
            other => Err(StoreError::Serialization(serde_json::Error::io(
                std::io::Error::other(format!("unknown job type: {other}")),
            ))),
        }
    }

    /// Charges the sale and settles its reservations.
    async fn finalize(&self, payload: FinalizePayload) -> store::Result<()> {
        let sale_id = payload.sale_id;

        let outcome = if payload.method == PaymentMethod::Cash {
            ChargeOutcome::Ok {
                provider_ref: CASH_REFERENCE.to_string(),
                attempts: 0,
                latency: Duration::ZERO,
            }
        } else {
            self.payments
                .charge_with_resilience(sale_id, payload.amount)
                .await?
        };

        match outcome {
            ChargeOutcome::Ok {
                provider_ref,
                attempts,
                ..
            } => {
                self.store
                    .record_payment_outcome(sale_id, PaymentOutcome::Completed { provider_ref })
                    .await?;
                let committed = self.store.commit_reservations(sale_id).await?;
                tracing::info!(sale_id = %sale_id, attempts, committed, "checkout finalized");
                metrics::counter!("checkouts_finalized_total", "outcome" => "completed")
                    .increment(1);
            }
            ChargeOutcome::Failed { attempts, last_error } => {
                self.store
                    .record_payment_outcome(sale_id, PaymentOutcome::Failed)
                    .await?;
                let released = self
                    .store
                    .release_reservations(sale_id, ReleaseReason::PaymentFailed)
                    .await?;
                for reservation in &released {
                    tracing::info!(
                        sale_id = %reservation.sale_id,
                        product_id = %reservation.product_id,
                        quantity = reservation.quantity,
                        reason = %ReleaseReason::PaymentFailed,
                        "reservation released"
                    );
                }
                tracing::warn!(
                    sale_id = %sale_id,
                    attempts,
                    error = %last_error,
                    "checkout finalization failed payment"
                );
                metrics::counter!("checkouts_finalized_total", "outcome" => "payment_failed")
                    .increment(1);
            }
            ChargeOutcome::Unavailable { retry_after } => {
                self.store
                    .record_payment_outcome(sale_id, PaymentOutcome::Failed)
                    .await?;
                self.store
                    .release_reservations(sale_id, ReleaseReason::PaymentFailed)
                    .await?;
                tracing::warn!(
                    sale_id = %sale_id,
                    retry_after = ?retry_after,
                    "checkout finalization rejected, payment circuit open"
                );
                metrics::counter!("checkouts_finalized_total", "outcome" => "unavailable")
                    .increment(1);
            }
        }
        Ok(())
    }

    /// Releases every ACTIVE reservation past its deadline. Returns how many
    /// were released.
    pub async fn sweep_expired(&self) -> store::Result<usize> {
        let released = self.store.release_expired_reservations(Utc::now()).await?;
        for reservation in &released {
            tracing::info!(
                sale_id = %reservation.sale_id,
                product_id = %reservation.product_id,
                quantity = reservation.quantity,
                reason = %ReleaseReason::TtlExpired,
                "reservation released"
            );
        }
        if !released.is_empty() {
            metrics::counter!("reservations_expired_total").increment(released.len() as u64);
        }
        Ok(released.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Money, ProductId, SaleId};
    use resilience::{
        BreakerConfig, CircuitBreaker, GatewayError, RetryPolicy, ScriptedGateway,
    };
    use store::{
        CartLine, InMemoryKeyValueStore, InMemoryStore, JobStatus, NewCheckout, PaymentStatus,
        ProductRecord, ReservationStatus, SaleStatus,
    };

    fn worker(
        store: InMemoryStore,
        gateway: ScriptedGateway,
        breaker_threshold: u32,
    ) -> QueueWorker<InMemoryStore, InMemoryKeyValueStore, ScriptedGateway> {
        let breaker = CircuitBreaker::new(
            "payment_gateway",
            InMemoryKeyValueStore::new(),
            BreakerConfig {
                threshold: breaker_threshold,
                window: Duration::from_secs(60),
                cool_off: Duration::from_secs(60),
            },
        );
        let retry =
            RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20), 0.0);
        let payments =
            ResilientPaymentService::new(gateway, breaker, retry, Duration::from_secs(2));
        QueueWorker::new(store, payments, WorkerConfig::default())
    }

    async fn seed_checkout(store: &InMemoryStore, ttl: chrono::TimeDelta) -> SaleId {
        store
            .upsert_product(ProductRecord {
                id: ProductId::from("sku-1"),
                name: "Widget".to_string(),
                price: Money::from_cents(2500),
                stock_quantity: 5,
                active: true,
            })
            .await
            .unwrap();
        let sale_id = SaleId::new();
        store
            .create_checkout(NewCheckout {
                sale_id,
                user_id: None,
                address: "1 Main St".to_string(),
                method: PaymentMethod::Card,
                total: Money::from_cents(5000),
                lines: vec![CartLine {
                    product_id: ProductId::from("sku-1"),
                    quantity: 2,
                    unit_price: Money::from_cents(2500),
                }],
                expires_at: Utc::now() + ttl,
            })
            .await
            .unwrap();
        sale_id
    }

    async fn enqueue_finalize(store: &InMemoryStore, sale_id: SaleId) -> common::JobId {
        let payload = serde_json::to_value(FinalizePayload {
            sale_id,
            method: PaymentMethod::Card,
            amount: Money::from_cents(5000),
        })
        .unwrap();
        store
            .enqueue_job(JOB_FINALIZE_FLASH_ORDER, payload)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn finalizes_a_queued_checkout() {
        let store = InMemoryStore::new();
        let sale_id = seed_checkout(&store, chrono::TimeDelta::minutes(15)).await;
        let job_id = enqueue_finalize(&store, sale_id).await;
        let worker = worker(store.clone(), ScriptedGateway::new(), 5);

        assert!(worker.run_once().await.unwrap());

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let sale = store.get_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Completed);

        let payment = store.get_payment(sale_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.reference.is_some());

        let reservations = store.get_reservations(sale_id).await.unwrap();
        assert!(
            reservations
                .iter()
                .all(|r| r.status == ReservationStatus::Committed)
        );
    }

    #[tokio::test]
    async fn declined_payment_is_a_handled_outcome() {
        let store = InMemoryStore::new();
        let sale_id = seed_checkout(&store, chrono::TimeDelta::minutes(15)).await;
        let job_id = enqueue_finalize(&store, sale_id).await;
        let gateway = ScriptedGateway::failing_with([GatewayError::Declined {
            reason: "Card expired".to_string(),
        }]);
        let worker = worker(store.clone(), gateway, 5);

        assert!(worker.run_once().await.unwrap());

        // The job completed even though the payment did not.
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let sale = store.get_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Failed);

        let product = store
            .get_product(&ProductId::from("sku-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let store = InMemoryStore::new();
        let sale_id = seed_checkout(&store, chrono::TimeDelta::minutes(15)).await;
        enqueue_finalize(&store, sale_id).await;
        let gateway = ScriptedGateway::failing_with([
            GatewayError::Server { code: 502 },
            GatewayError::Server { code: 503 },
        ]);
        let worker = worker(store.clone(), gateway.clone(), 10);

        assert!(worker.run_once().await.unwrap());

        let sale = store.get_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Completed);
        assert_eq!(gateway.charge_count(), 3);
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_job() {
        let store = InMemoryStore::new();
        let job = store
            .enqueue_job(JOB_FINALIZE_FLASH_ORDER, serde_json::json!({"bogus": true}))
            .await
            .unwrap();
        let worker = worker(store.clone(), ScriptedGateway::new(), 5);

        assert!(worker.run_once().await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.is_some());
    }

    #[tokio::test]
    async fn unknown_job_type_fails_the_job() {
        let store = InMemoryStore::new();
        let job = store
            .enqueue_job("send_newsletter", serde_json::json!({}))
            .await
            .unwrap();
        let worker = worker(store.clone(), ScriptedGateway::new(), 5);

        assert!(worker.run_once().await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let worker = worker(InMemoryStore::new(), ScriptedGateway::new(), 5);
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn sweep_releases_only_expired_reservations() {
        let store = InMemoryStore::new();
        // Already past its deadline when the sweep runs.
        let expired = seed_checkout(&store, chrono::TimeDelta::milliseconds(-100)).await;
        let worker = worker(store.clone(), ScriptedGateway::new(), 5);

        assert_eq!(worker.sweep_expired().await.unwrap(), 1);

        let reservations = store.get_reservations(expired).await.unwrap();
        assert!(
            reservations
                .iter()
                .all(|r| r.status == ReservationStatus::Released)
        );
        let product = store
            .get_product(&ProductId::from("sku-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 5);

        // A second sweep has nothing left to release.
        assert_eq!(worker.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn open_circuit_releases_stock_and_completes_the_job() {
        let store = InMemoryStore::new();
        let sale_id = seed_checkout(&store, chrono::TimeDelta::minutes(15)).await;
        let job_id = enqueue_finalize(&store, sale_id).await;
        let gateway = ScriptedGateway::failing_with([GatewayError::Server { code: 502 }]);
        // Threshold of one: the first failure opens the circuit mid-retry.
        let worker = worker(store.clone(), gateway, 1);

        assert!(worker.run_once().await.unwrap());

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let sale = store.get_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Failed);

        let product = store
            .get_product(&ProductId::from("sku-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 5);
    }
}
