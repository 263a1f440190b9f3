//! Payment calls wrapped in the full resilience stack.

use std::time::Duration;

use common::{Money, SaleId};
use store::KeyValueStore;

use crate::{CircuitBreaker, GatewayError, PaymentGateway, RetryPolicy};

/// Final outcome of a charge after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The charge was approved.
    Ok {
        provider_ref: String,
        attempts: u32,
        latency: Duration,
    },
    /// Every attempt failed, or the error was terminal.
    Failed {
        attempts: u32,
        last_error: GatewayError,
    },
    /// The circuit is open; no call was made.
    Unavailable { retry_after: Duration },
}

impl ChargeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChargeOutcome::Ok { .. })
    }
}

/// Final outcome of a void after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoidOutcome {
    Ok { attempts: u32 },
    Failed {
        attempts: u32,
        last_error: GatewayError,
    },
    Unavailable { retry_after: Duration },
}

/// Longest `retry_after` hint handed to clients when the circuit is open.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Payment gateway wrapped in a circuit breaker and a retry policy.
///
/// The breaker is consulted before every attempt, so a circuit that opens
/// mid-retry stops the loop instead of hammering a known-bad dependency.
/// Declines and malformed requests are business outcomes: they end the loop
/// immediately and never count against the breaker.
pub struct ResilientPaymentService<G, K> {
    gateway: G,
    breaker: CircuitBreaker<K>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<G, K> ResilientPaymentService<G, K>
where
    G: PaymentGateway,
    K: KeyValueStore,
{
    pub fn new(gateway: G, breaker: CircuitBreaker<K>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            gateway,
            breaker,
            retry,
            timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker<K> {
        &self.breaker
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    async fn retry_after(&self) -> Duration {
        self.breaker
            .remaining_cool_off()
            .await
            .ok()
            .flatten()
            .unwrap_or(MAX_RETRY_AFTER)
            .min(MAX_RETRY_AFTER)
    }

    /// Charges a sale, retrying transient gateway failures with backoff.
    #[tracing::instrument(skip(self), fields(sale_id = %sale_id, amount = %amount))]
    pub async fn charge_with_resilience(
        &self,
        sale_id: SaleId,
        amount: Money,
    ) -> store::Result<ChargeOutcome> {
        let started = std::time::Instant::now();
        let mut attempt = 0u32;

        loop {
            if !self.breaker.can_execute().await? {
                let retry_after = self.retry_after().await;
                tracing::warn!(sale_id = %sale_id, "payment rejected, circuit open");
                metrics::counter!("payments_rejected_open_circuit_total").increment(1);
                return Ok(ChargeOutcome::Unavailable { retry_after });
            }

            attempt += 1;
            let attempt_started = std::time::Instant::now();
            let result = tokio::time::timeout(
                self.timeout,
                self.gateway.charge(sale_id, amount, self.timeout),
            )
            .await
            .unwrap_or(Err(GatewayError::Timeout {
                timeout: self.timeout,
            }));
            let attempt_latency = attempt_started.elapsed();
            metrics::histogram!("payment_attempt_duration_seconds")
                .record(attempt_latency.as_secs_f64());

            match result {
                Ok(approval) => {
                    self.breaker.on_success().await?;
                    tracing::info!(
                        sale_id = %sale_id,
                        attempt,
                        latency_ms = attempt_latency.as_millis() as u64,
                        "payment approved"
                    );
                    metrics::counter!("payments_approved_total").increment(1);
                    return Ok(ChargeOutcome::Ok {
                        provider_ref: approval.provider_ref,
                        attempts: attempt,
                        latency: started.elapsed(),
                    });
                }
                Err(error) if error.is_retryable() => {
                    self.breaker.on_failure().await?;
                    tracing::warn!(
                        sale_id = %sale_id,
                        attempt,
                        latency_ms = attempt_latency.as_millis() as u64,
                        error = %error,
                        "payment attempt failed"
                    );
                    metrics::counter!("payment_attempts_failed_total").increment(1);

                    if !self.retry.should_retry(&error, attempt) {
                        return Ok(ChargeOutcome::Failed {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(error) => {
                    tracing::info!(
                        sale_id = %sale_id,
                        attempt,
                        error = %error,
                        "payment ended with terminal error"
                    );
                    metrics::counter!("payments_terminal_errors_total").increment(1);
                    return Ok(ChargeOutcome::Failed {
                        attempts: attempt,
                        last_error: error,
                    });
                }
            }
        }
    }

    /// Voids a previously approved charge with the same retry discipline.
    #[tracing::instrument(skip(self, provider_ref))]
    pub async fn void_with_resilience(&self, provider_ref: &str) -> store::Result<VoidOutcome> {
        let mut attempt = 0u32;

        loop {
            if !self.breaker.can_execute().await? {
                let retry_after = self.retry_after().await;
                return Ok(VoidOutcome::Unavailable { retry_after });
            }

            attempt += 1;
            let result = tokio::time::timeout(
                self.timeout,
                self.gateway.void(provider_ref, self.timeout),
            )
            .await
            .unwrap_or(Err(GatewayError::Timeout {
                timeout: self.timeout,
            }));

            match result {
                Ok(()) => {
                    self.breaker.on_success().await?;
                    return Ok(VoidOutcome::Ok { attempts: attempt });
                }
                Err(error) if error.is_retryable() => {
                    self.breaker.on_failure().await?;
                    if !self.retry.should_retry(&error, attempt) {
                        return Ok(VoidOutcome::Failed {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(error) => {
                    return Ok(VoidOutcome::Failed {
                        attempts: attempt,
                        last_error: error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BreakerConfig, BreakerState, ScriptedGateway};
    use store::InMemoryKeyValueStore;

    fn service(
        gateway: ScriptedGateway,
        threshold: u32,
    ) -> ResilientPaymentService<ScriptedGateway, InMemoryKeyValueStore> {
        let breaker = CircuitBreaker::new(
            "payment_gateway",
            InMemoryKeyValueStore::new(),
            BreakerConfig {
                threshold,
                window: Duration::from_secs(60),
                cool_off: Duration::from_secs(60),
            },
        );
        let retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40), 0.0);
        ResilientPaymentService::new(gateway, breaker, retry, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn approves_on_first_attempt() {
        let svc = service(ScriptedGateway::new(), 5);
        let outcome = svc
            .charge_with_resilience(SaleId::new(), Money::from_cents(1500))
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Ok { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let gateway = ScriptedGateway::failing_with([
            GatewayError::Server { code: 502 },
            GatewayError::Server { code: 503 },
        ]);
        let svc = service(gateway.clone(), 10);

        let outcome = svc
            .charge_with_resilience(SaleId::new(), Money::from_cents(1500))
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Ok { attempts: 3, .. }));
        assert_eq!(gateway.charge_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_error() {
        let gateway = ScriptedGateway::failing_with([
            GatewayError::Server { code: 502 },
            GatewayError::Server { code: 502 },
            GatewayError::Server { code: 504 },
        ]);
        let svc = service(gateway.clone(), 10);

        let outcome = svc
            .charge_with_resilience(SaleId::new(), Money::from_cents(1500))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Failed {
                attempts: 3,
                last_error: GatewayError::Server { code: 504 },
            }
        );
        assert_eq!(gateway.charge_count(), 3);
    }

    #[tokio::test]
    async fn decline_ends_immediately_without_tripping_breaker() {
        let gateway = ScriptedGateway::failing_with([GatewayError::Declined {
            reason: "Insufficient funds".to_string(),
        }]);
        let svc = service(gateway.clone(), 1);

        let outcome = svc
            .charge_with_resilience(SaleId::new(), Money::from_cents(1500))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ChargeOutcome::Failed {
                attempts: 1,
                last_error: GatewayError::Declined { .. },
            }
        ));
        assert_eq!(gateway.charge_count(), 1);
        assert_eq!(svc.breaker().state().await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_calling_gateway() {
        let gateway = ScriptedGateway::failing_with([GatewayError::Server { code: 502 }]);
        // Threshold of one: the first failure opens the circuit mid-loop.
        let svc = service(gateway.clone(), 1);

        let outcome = svc
            .charge_with_resilience(SaleId::new(), Money::from_cents(1500))
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Unavailable { .. }));
        assert_eq!(gateway.charge_count(), 1);

        // Subsequent calls fail fast before the gateway.
        let outcome = svc
            .charge_with_resilience(SaleId::new(), Money::from_cents(1500))
            .await
            .unwrap();
        if let ChargeOutcome::Unavailable { retry_after } = outcome {
            assert!(retry_after <= Duration::from_secs(5));
        } else {
            panic!("expected Unavailable, got {outcome:?}");
        }
        assert_eq!(gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn void_retries_then_succeeds() {
        let gateway =
            ScriptedGateway::failing_with([GatewayError::Timeout {
                timeout: Duration::from_secs(2),
            }]);
        let svc = service(gateway.clone(), 10);

        let outcome = svc.void_with_resilience("txn_abc_1").await.unwrap();
        assert_eq!(outcome, VoidOutcome::Ok { attempts: 2 });
        assert_eq!(gateway.void_count(), 2);
    }
}
