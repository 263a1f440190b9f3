use std::time::{Duration, SystemTime, UNIX_EPOCH};

use store::{KeyValueStore, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; calls allowed.
    Closed,
    /// Failing fast; calls rejected until the cool-off elapses.
    Open,
    /// Testing whether the dependency recovered; one probe allowed.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            "half_open" => Some(BreakerState::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the rolling window that open the circuit.
    pub threshold: u32,
    /// Length of the rolling failure window.
    pub window: Duration,
    /// How long the circuit stays open past the last failure.
    pub cool_off: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60),
            cool_off: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker, for monitoring endpoints.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: usize,
    pub threshold: u32,
    pub window: Duration,
    pub cool_off: Duration,
}

/// Failure-count-driven circuit breaker.
///
/// State and failure timestamps live in the shared key-value store keyed by
/// breaker name, so every concurrent caller observes the same circuit; no
/// in-process state is authoritative. Callers tolerate benign read-modify-
/// write races (two probes may slip through at the half-open boundary) but
/// failures required to open the circuit are never under-counted past the
/// threshold check.
#[derive(Clone)]
pub struct CircuitBreaker<K> {
    name: String,
    kv: K,
    config: BreakerConfig,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl<K: KeyValueStore> CircuitBreaker<K> {
    pub fn new(name: impl Into<String>, kv: K, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            kv,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state_key(&self) -> String {
        format!("cb:{}:state", self.name)
    }

    fn failures_key(&self) -> String {
        format!("cb:{}:failures", self.name)
    }

    fn last_failure_key(&self) -> String {
        format!("cb:{}:last_failure", self.name)
    }

    /// Current state. Missing or unrecognized stored state reads as CLOSED.
    pub async fn state(&self) -> Result<BreakerState> {
        let stored = self.kv.get(&self.state_key()).await?;
        Ok(stored
            .as_ref()
            .and_then(|v| v.as_str())
            .and_then(BreakerState::parse)
            .unwrap_or(BreakerState::Closed))
    }

    async fn set_state(&self, new_state: BreakerState) -> Result<()> {
        let old_state = self.state().await?;
        self.kv
            .set(
                &self.state_key(),
                serde_json::json!(new_state.as_str()),
                Some(self.config.cool_off * 2),
            )
            .await?;

        if old_state != new_state {
            tracing::info!(
                breaker = %self.name,
                from = %old_state,
                to = %new_state,
                "circuit breaker transition"
            );
            metrics::counter!("circuit_breaker_transitions_total").increment(1);
        }
        Ok(())
    }

    async fn failures(&self) -> Result<Vec<f64>> {
        let stored = self.kv.get(&self.failures_key()).await?;
        Ok(stored
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default())
    }

    async fn last_failure(&self) -> Result<Option<f64>> {
        let stored = self.kv.get(&self.last_failure_key()).await?;
        Ok(stored.and_then(|v| v.as_f64()))
    }

    /// Appends a failure timestamp, pruning entries outside the rolling
    /// window, and returns the count of failures still inside it.
    async fn record_failure(&self) -> Result<usize> {
        let now = epoch_now();
        let cutoff = now - self.config.window.as_secs_f64();

        let mut failures = self.failures().await?;
        failures.push(now);
        failures.retain(|&t| t > cutoff);
        let count = failures.len();

        self.kv
            .set(
                &self.failures_key(),
                serde_json::json!(failures),
                Some(self.config.window * 2),
            )
            .await?;
        self.kv
            .set(
                &self.last_failure_key(),
                serde_json::json!(now),
                Some(self.config.cool_off * 2),
            )
            .await?;
        Ok(count)
    }

    async fn clear_failures(&self) -> Result<()> {
        self.kv.delete(&self.failures_key()).await?;
        self.kv.delete(&self.last_failure_key()).await
    }

    /// Whether a call may proceed. In OPEN, a read past the cool-off
    /// deadline transitions to HALF_OPEN and lets the probing call through.
    pub async fn can_execute(&self) -> Result<bool> {
        match self.state().await? {
            BreakerState::Closed => Ok(true),
            BreakerState::Open => {
                if let Some(last) = self.last_failure().await?
                    && epoch_now() - last >= self.config.cool_off.as_secs_f64()
                {
                    self.set_state(BreakerState::HalfOpen).await?;
                    return Ok(true);
                }
                Ok(false)
            }
            BreakerState::HalfOpen => Ok(true),
        }
    }

    /// Records a successful call. A success in HALF_OPEN closes the
    /// circuit; success always clears the failure history.
    pub async fn on_success(&self) -> Result<()> {
        if self.state().await? == BreakerState::HalfOpen {
            self.set_state(BreakerState::Closed).await?;
        }
        self.clear_failures().await
    }

    /// Records a failed call. A failure in HALF_OPEN reopens the circuit
    /// and restarts the cool-off clock; in CLOSED, reaching the threshold
    /// opens the circuit and resets the failure window.
    pub async fn on_failure(&self) -> Result<()> {
        match self.state().await? {
            BreakerState::HalfOpen => {
                self.set_state(BreakerState::Open).await?;
                self.record_failure().await?;
                Ok(())
            }
            BreakerState::Closed => {
                let count = self.record_failure().await?;
                if count >= self.config.threshold as usize {
                    self.set_state(BreakerState::Open).await?;
                    // The window restarts at the transition; only
                    // last_failure carries the cool-off clock forward.
                    self.kv.delete(&self.failures_key()).await?;
                }
                Ok(())
            }
            BreakerState::Open => Ok(()),
        }
    }

    /// Time left before an OPEN circuit starts probing, if any.
    pub async fn remaining_cool_off(&self) -> Result<Option<Duration>> {
        if self.state().await? != BreakerState::Open {
            return Ok(None);
        }
        let Some(last) = self.last_failure().await? else {
            return Ok(None);
        };
        let elapsed = epoch_now() - last;
        let remaining = self.config.cool_off.as_secs_f64() - elapsed;
        Ok((remaining > 0.0).then(|| Duration::from_secs_f64(remaining)))
    }

    /// Snapshot of state and failure count for monitoring.
    pub async fn snapshot(&self) -> Result<BreakerSnapshot> {
        Ok(BreakerSnapshot {
            state: self.state().await?,
            failure_count: self.failures().await?.len(),
            threshold: self.config.threshold,
            window: self.config.window,
            cool_off: self.config.cool_off,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryKeyValueStore;

    fn breaker(threshold: u32, cool_off: Duration) -> CircuitBreaker<InMemoryKeyValueStore> {
        CircuitBreaker::new(
            "payment_gateway",
            InMemoryKeyValueStore::new(),
            BreakerConfig {
                threshold,
                window: Duration::from_secs(60),
                cool_off,
            },
        )
    }

    #[tokio::test]
    async fn starts_closed_and_allows_calls() {
        let cb = breaker(5, Duration::from_secs(60));
        assert_eq!(cb.state().await.unwrap(), BreakerState::Closed);
        assert!(cb.can_execute().await.unwrap());
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            cb.on_failure().await.unwrap();
            assert_eq!(cb.state().await.unwrap(), BreakerState::Closed);
        }
        cb.on_failure().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), BreakerState::Open);
        assert!(!cb.can_execute().await.unwrap());

        // Window was reset at the transition.
        assert_eq!(cb.snapshot().await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn cool_off_transitions_to_half_open_probe() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.on_failure().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), BreakerState::Open);
        assert!(!cb.can_execute().await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.can_execute().await.unwrap());
        assert_eq!(cb.state().await.unwrap(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn success_in_half_open_closes_and_clears_history() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.on_failure().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.can_execute().await.unwrap());

        cb.on_success().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), BreakerState::Closed);
        assert_eq!(cb.snapshot().await.unwrap().failure_count, 0);
        assert!(cb.remaining_cool_off().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens_and_restarts_cool_off() {
        let cb = breaker(1, Duration::from_millis(60));
        cb.on_failure().await.unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(cb.can_execute().await.unwrap());
        assert_eq!(cb.state().await.unwrap(), BreakerState::HalfOpen);

        cb.on_failure().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), BreakerState::Open);
        assert!(!cb.can_execute().await.unwrap());
        assert!(cb.remaining_cool_off().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failures_outside_the_window_do_not_accumulate() {
        let cb = CircuitBreaker::new(
            "payment_gateway",
            InMemoryKeyValueStore::new(),
            BreakerConfig {
                threshold: 2,
                window: Duration::from_millis(40),
                cool_off: Duration::from_secs(60),
            },
        );

        // Each failure lands after the previous one has aged out of the
        // window, so the count never reaches the threshold.
        for _ in 0..3 {
            cb.on_failure().await.unwrap();
            assert_eq!(cb.state().await.unwrap(), BreakerState::Closed);
            assert_eq!(cb.snapshot().await.unwrap().failure_count, 1);
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert!(cb.can_execute().await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_callers_share_state_through_the_store() {
        let kv = InMemoryKeyValueStore::new();
        let config = BreakerConfig {
            threshold: 2,
            window: Duration::from_secs(60),
            cool_off: Duration::from_secs(60),
        };
        let a = CircuitBreaker::new("payment_gateway", kv.clone(), config.clone());
        let b = CircuitBreaker::new("payment_gateway", kv, config);

        a.on_failure().await.unwrap();
        b.on_failure().await.unwrap();

        assert_eq!(a.state().await.unwrap(), BreakerState::Open);
        assert!(!b.can_execute().await.unwrap());
    }
}
