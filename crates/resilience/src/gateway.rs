//! Payment gateway seam.
//!
//! [`SimulatedGateway`] stands in for the real provider with configurable
//! fault injection; [`ScriptedGateway`] gives tests exact control over the
//! outcome of each call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;

use common::{Money, SaleId};

use crate::GatewayError;

/// A successful charge, carrying the provider's reference for the
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeApproval {
    pub provider_ref: String,
}

/// External payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges `amount` for a sale. The call must resolve within `timeout`;
    /// a slower gateway surfaces as [`GatewayError::Timeout`].
    async fn charge(
        &self,
        sale_id: SaleId,
        amount: Money,
        timeout: Duration,
    ) -> Result<ChargeApproval, GatewayError>;

    /// Voids a previously approved charge by provider reference.
    async fn void(&self, provider_ref: &str, timeout: Duration) -> Result<(), GatewayError>;
}

#[async_trait]
impl<G: PaymentGateway + ?Sized> PaymentGateway for Arc<G> {
    async fn charge(
        &self,
        sale_id: SaleId,
        amount: Money,
        timeout: Duration,
    ) -> Result<ChargeApproval, GatewayError> {
        (**self).charge(sale_id, amount, timeout).await
    }

    async fn void(&self, provider_ref: &str, timeout: Duration) -> Result<(), GatewayError> {
        (**self).void(provider_ref, timeout).await
    }
}

/// Gateway simulator with probabilistic fault injection.
///
/// Each call rolls independently: with `timeout_rate` probability it times
/// out, with `failure_rate` probability it fails server-side, otherwise it
/// approves after a short random latency.
pub struct SimulatedGateway {
    failure_rate: f64,
    timeout_rate: f64,
    call_count: AtomicU64,
}

impl SimulatedGateway {
    pub fn new(failure_rate: f64, timeout_rate: f64) -> Self {
        Self {
            failure_rate,
            timeout_rate,
            call_count: AtomicU64::new(0),
        }
    }

    /// A gateway that always approves.
    pub fn reliable() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Total calls made, charges and voids combined.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(0.1, 0.05)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(
        &self,
        sale_id: SaleId,
        amount: Money,
        timeout: Duration,
    ) -> Result<ChargeApproval, GatewayError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;

        // Roll the dice before any await so the rng never crosses one.
        let (roll, latency_ms) = {
            let mut rng = rand::thread_rng();
            (rng.r#gen::<f64>(), rng.gen_range(10..60))
        };

        if roll < self.timeout_rate {
            tokio::time::sleep(timeout).await;
            return Err(GatewayError::Timeout { timeout });
        }

        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        if roll < self.timeout_rate + self.failure_rate {
            return Err(GatewayError::Server { code: 502 });
        }

        if !amount.is_positive() {
            return Err(GatewayError::InvalidRequest {
                reason: "amount must be positive".to_string(),
            });
        }

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(ChargeApproval {
            provider_ref: format!("txn_{}_{}_{}", sale_id, n, epoch),
        })
    }

    async fn void(&self, provider_ref: &str, _timeout: Duration) -> Result<(), GatewayError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if provider_ref.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "empty provider reference".to_string(),
            });
        }
        Ok(())
    }
}

/// Gateway whose next outcomes are scripted in order.
///
/// Once the script runs dry every further call approves. Cloning shares the
/// script and the counter.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    script: Arc<Mutex<VecDeque<Result<(), GatewayError>>>>,
    charges: Arc<AtomicU64>,
    voids: Arc<AtomicU64>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a gateway scripted to fail with each error in turn, then
    /// approve everything after.
    pub fn failing_with(errors: impl IntoIterator<Item = GatewayError>) -> Self {
        let queue: VecDeque<_> = errors.into_iter().map(Err).collect();
        Self {
            script: Arc::new(Mutex::new(queue)),
            ..Self::default()
        }
    }

    /// Appends an outcome to the script.
    pub async fn push(&self, outcome: Result<(), GatewayError>) {
        self.script.lock().await.push_back(outcome);
    }

    pub fn charge_count(&self) -> u64 {
        self.charges.load(Ordering::SeqCst)
    }

    pub fn void_count(&self) -> u64 {
        self.voids.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(
        &self,
        sale_id: SaleId,
        _amount: Money,
        _timeout: Duration,
    ) -> Result<ChargeApproval, GatewayError> {
        let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.lock().await.pop_front() {
            Some(Err(error)) => Err(error),
            _ => Ok(ChargeApproval {
                provider_ref: format!("txn_{}_{}", sale_id, n),
            }),
        }
    }

    async fn void(&self, _provider_ref: &str, _timeout: Duration) -> Result<(), GatewayError> {
        self.voids.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Err(error)) => Err(error),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reliable_gateway_always_approves() {
        let gateway = SimulatedGateway::reliable();
        let sale_id = SaleId::new();
        let approval = gateway
            .charge(sale_id, Money::from_cents(2500), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(approval.provider_ref.starts_with(&format!("txn_{sale_id}_1_")));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn always_failing_gateway_returns_server_error() {
        let gateway = SimulatedGateway::new(1.0, 0.0);
        let result = gateway
            .charge(SaleId::new(), Money::from_cents(100), Duration::from_secs(2))
            .await;
        assert_eq!(result, Err(GatewayError::Server { code: 502 }));
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let gateway = SimulatedGateway::reliable();
        let result = gateway
            .charge(SaleId::new(), Money::zero(), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn scripted_outcomes_play_in_order_then_approve() {
        let gateway = ScriptedGateway::failing_with([
            GatewayError::Timeout {
                timeout: Duration::from_secs(2),
            },
            GatewayError::Server { code: 503 },
        ]);
        let sale_id = SaleId::new();
        let amount = Money::from_cents(999);

        assert!(
            gateway
                .charge(sale_id, amount, Duration::from_secs(2))
                .await
                .is_err()
        );
        assert!(
            gateway
                .charge(sale_id, amount, Duration::from_secs(2))
                .await
                .is_err()
        );
        let approval = gateway
            .charge(sale_id, amount, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(approval.provider_ref, format!("txn_{sale_id}_3"));
        assert_eq!(gateway.charge_count(), 3);
    }
}
