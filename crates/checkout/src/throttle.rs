//! Sliding-window rate limiting at three granularities.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::ProductId;
use store::{KeyValueStore, Result};

/// One sliding window: at most `limit` requests per `window`.
#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    pub limit: u32,
    pub window: Duration,
}

/// Throttle limits per granularity.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Requests by one identity for one specific product.
    pub per_identity_product: WindowLimit,
    /// All requests by one identity.
    pub per_identity: WindowLimit,
    /// All requests system-wide.
    pub global: WindowLimit,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let per_identity = WindowLimit {
            limit: 5,
            window: Duration::from_secs(60),
        };
        Self {
            per_identity_product: per_identity,
            per_identity,
            global: WindowLimit {
                limit: 100,
                window: Duration::from_secs(60),
            },
        }
    }
}

/// Why a request was denied, and when to try again.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleDenial {
    pub reason: String,
    pub retry_after: Duration,
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    Allowed,
    Denied(ThrottleDenial),
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ThrottleDecision::Allowed)
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Multi-granularity sliding-window throttle backed by the shared counter
/// store.
///
/// Windows are checked finest-first: one hot product cannot exhaust an
/// identity's whole quota, and one identity cannot exhaust the system's. A
/// denial at any stage short-circuits the rest, and timestamps are recorded
/// only when every window permits the request.
#[derive(Clone)]
pub struct Throttle<K> {
    kv: K,
    config: ThrottleConfig,
}

impl<K: KeyValueStore> Throttle<K> {
    pub fn new(kv: K, config: ThrottleConfig) -> Self {
        Self { kv, config }
    }

    fn identity_key(identity: &str) -> String {
        format!("throttle_user_{identity}")
    }

    fn identity_product_key(identity: &str, product_id: &ProductId) -> String {
        format!("throttle_user_product_{identity}_{product_id}")
    }

    const GLOBAL_KEY: &'static str = "throttle_global";

    async fn window_timestamps(&self, key: &str, window: Duration, now: f64) -> Result<Vec<f64>> {
        let cutoff = now - window.as_secs_f64();
        let stored = self.kv.get(key).await?;
        let mut timestamps: Vec<f64> = stored
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();
        timestamps.retain(|&t| t > cutoff);
        Ok(timestamps)
    }

    /// Denial wait: the window re-admits once its oldest hit ages out.
    fn denial(timestamps: &[f64], limit: WindowLimit, now: f64, reason: &str) -> ThrottleDenial {
        let oldest = timestamps.first().copied().unwrap_or(now);
        let retry_after = (limit.window.as_secs_f64() - (now - oldest)).max(0.0);
        ThrottleDenial {
            reason: reason.to_string(),
            retry_after: Duration::from_secs_f64(retry_after),
        }
    }

    async fn record(&self, key: &str, mut timestamps: Vec<f64>, limit: WindowLimit, now: f64) -> Result<()> {
        timestamps.push(now);
        self.kv
            .set(key, serde_json::json!(timestamps), Some(limit.window))
            .await
    }

    /// Checks all applicable windows and, if every one permits, records the
    /// request in each of them.
    pub async fn allow(
        &self,
        identity: &str,
        product_id: Option<&ProductId>,
    ) -> Result<ThrottleDecision> {
        let now = epoch_now();
        let config = self.config;

        let product_window = match product_id {
            Some(pid) => {
                let key = Self::identity_product_key(identity, pid);
                let timestamps = self
                    .window_timestamps(&key, config.per_identity_product.window, now)
                    .await?;
                if timestamps.len() >= config.per_identity_product.limit as usize {
                    let denial = Self::denial(
                        &timestamps,
                        config.per_identity_product,
                        now,
                        "Too many requests for this product",
                    );
                    metrics::counter!("throttle_denials_total", "scope" => "identity_product")
                        .increment(1);
                    tracing::debug!(identity, product_id = %pid, "throttled on product window");
                    return Ok(ThrottleDecision::Denied(denial));
                }
                Some((key, timestamps))
            }
            None => None,
        };

        let identity_key = Self::identity_key(identity);
        let identity_timestamps = self
            .window_timestamps(&identity_key, config.per_identity.window, now)
            .await?;
        if identity_timestamps.len() >= config.per_identity.limit as usize {
            let denial = Self::denial(
                &identity_timestamps,
                config.per_identity,
                now,
                "Too many requests",
            );
            metrics::counter!("throttle_denials_total", "scope" => "identity").increment(1);
            tracing::debug!(identity, "throttled on identity window");
            return Ok(ThrottleDecision::Denied(denial));
        }

        let global_timestamps = self
            .window_timestamps(Self::GLOBAL_KEY, config.global.window, now)
            .await?;
        if global_timestamps.len() >= config.global.limit as usize {
            let denial = Self::denial(
                &global_timestamps,
                config.global,
                now,
                "System is under heavy load",
            );
            metrics::counter!("throttle_denials_total", "scope" => "global").increment(1);
            tracing::warn!("throttled on global window");
            return Ok(ThrottleDecision::Denied(denial));
        }

        if let Some((key, timestamps)) = product_window {
            self.record(&key, timestamps, config.per_identity_product, now)
                .await?;
        }
        self.record(&identity_key, identity_timestamps, config.per_identity, now)
            .await?;
        self.record(Self::GLOBAL_KEY, global_timestamps, config.global, now)
            .await?;

        Ok(ThrottleDecision::Allowed)
    }

    /// Live counts per window for an identity, for monitoring.
    pub async fn status(
        &self,
        identity: &str,
        product_id: Option<&ProductId>,
    ) -> Result<ThrottleStatus> {
        let now = epoch_now();
        let identity_count = self
            .window_timestamps(&Self::identity_key(identity), self.config.per_identity.window, now)
            .await?
            .len();
        let product_count = match product_id {
            Some(pid) => Some(
                self.window_timestamps(
                    &Self::identity_product_key(identity, pid),
                    self.config.per_identity_product.window,
                    now,
                )
                .await?
                .len(),
            ),
            None => None,
        };
        let global_count = self
            .window_timestamps(Self::GLOBAL_KEY, self.config.global.window, now)
            .await?
            .len();
        Ok(ThrottleStatus {
            identity_count,
            product_count,
            global_count,
        })
    }

    /// Forgets an identity's windows. Product windows are keyed separately
    /// and age out on their own.
    pub async fn clear(&self, identity: &str) -> Result<()> {
        self.kv.delete(&Self::identity_key(identity)).await
    }
}

/// Current window occupancy for an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleStatus {
    pub identity_count: usize,
    pub product_count: Option<usize>,
    pub global_count: usize,
}
