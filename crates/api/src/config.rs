//! Application configuration loaded from environment variables.

use std::time::Duration;

use checkout::{CheckoutConfig, ThrottleConfig, WindowLimit};
use resilience::{BreakerConfig, RetryPolicy};
use worker::WorkerConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `FLASH_SALE_ENABLED` — feature flag for the queued path (default: `true`)
/// - `THROTTLE_PER_USER` / `THROTTLE_PER_USER_SECONDS` — per-identity window (default: 5 / 60)
/// - `THROTTLE_GLOBAL` / `THROTTLE_GLOBAL_SECONDS` — global window (default: 100 / 60)
/// - `BREAKER_THRESHOLD` / `BREAKER_WINDOW_SECONDS` / `BREAKER_COOL_OFF_SECONDS` (default: 5 / 60 / 60)
/// - `RESERVATION_TTL_MINUTES` — stock hold lifetime (default: 15)
/// - `PAYMENT_TIMEOUT_SECONDS` — per-attempt gateway timeout (default: 2)
/// - `WORKER_POLL_INTERVAL_SECONDS` / `WORKER_SWEEP_INTERVAL_SECONDS` (default: 5 / 300)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub flash_sale_enabled: bool,
    pub throttle_per_user: u32,
    pub throttle_per_user_seconds: u64,
    pub throttle_global: u32,
    pub throttle_global_seconds: u64,
    pub breaker_threshold: u32,
    pub breaker_window_seconds: u64,
    pub breaker_cool_off_seconds: u64,
    pub reservation_ttl_minutes: u64,
    pub payment_timeout_seconds: u64,
    pub worker_poll_interval_seconds: u64,
    pub worker_sweep_interval_seconds: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            flash_sale_enabled: env_parse("FLASH_SALE_ENABLED", true),
            throttle_per_user: env_parse("THROTTLE_PER_USER", 5),
            throttle_per_user_seconds: env_parse("THROTTLE_PER_USER_SECONDS", 60),
            throttle_global: env_parse("THROTTLE_GLOBAL", 100),
            throttle_global_seconds: env_parse("THROTTLE_GLOBAL_SECONDS", 60),
            breaker_threshold: env_parse("BREAKER_THRESHOLD", 5),
            breaker_window_seconds: env_parse("BREAKER_WINDOW_SECONDS", 60),
            breaker_cool_off_seconds: env_parse("BREAKER_COOL_OFF_SECONDS", 60),
            reservation_ttl_minutes: env_parse("RESERVATION_TTL_MINUTES", 15),
            payment_timeout_seconds: env_parse("PAYMENT_TIMEOUT_SECONDS", 2),
            worker_poll_interval_seconds: env_parse("WORKER_POLL_INTERVAL_SECONDS", 5),
            worker_sweep_interval_seconds: env_parse("WORKER_SWEEP_INTERVAL_SECONDS", 300),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        let per_identity = WindowLimit {
            limit: self.throttle_per_user,
            window: Duration::from_secs(self.throttle_per_user_seconds),
        };
        ThrottleConfig {
            per_identity_product: per_identity,
            per_identity,
            global: WindowLimit {
                limit: self.throttle_global,
                window: Duration::from_secs(self.throttle_global_seconds),
            },
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker_threshold,
            window: Duration::from_secs(self.breaker_window_seconds),
            cool_off: Duration::from_secs(self.breaker_cool_off_seconds),
        }
    }

    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig {
            reservation_ttl: Duration::from_secs(self.reservation_ttl_minutes * 60),
            flash_enabled: self.flash_sale_enabled,
            ..CheckoutConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_seconds)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_secs(self.worker_poll_interval_seconds),
            sweep_interval: Duration::from_secs(self.worker_sweep_interval_seconds),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            flash_sale_enabled: true,
            throttle_per_user: 5,
            throttle_per_user_seconds: 60,
            throttle_global: 100,
            throttle_global_seconds: 60,
            breaker_threshold: 5,
            breaker_window_seconds: 60,
            breaker_cool_off_seconds: 60,
            reservation_ttl_minutes: 15,
            payment_timeout_seconds: 2,
            worker_poll_interval_seconds: 5,
            worker_sweep_interval_seconds: 300,
        }
    }
}
