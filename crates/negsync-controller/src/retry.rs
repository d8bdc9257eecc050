//! Exponential backoff with jitter for transient lookup failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::duration_millis;
use crate::error::{ControllerError, Result};

/// Retry policy for a single logical operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first (0 = retry forever, rejected by `validate`)
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Reject policies that never give up or cannot compute a delay
    pub fn validate(&self, field: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ControllerError::invalid_config(
                format!("{}.maxAttempts must be at least 1", field),
                "Bound the retries; the next pass retries anyway",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 0.0 {
            return Err(ControllerError::invalid_config(
                format!(
                    "{}.backoffMultiplier must be a positive number, got {}",
                    field, self.backoff_multiplier
                ),
                "Use 1.0 for a constant delay or 2.0 to double it on every retry",
            ));
        }
        Ok(())
    }

    /// Delay before the attempt following `delay`, capped at `max_delay`
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
///
/// Returns the last error once attempts run out. Sleeps between attempts
/// scale by `backoff_multiplier` with 0.5x..1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
