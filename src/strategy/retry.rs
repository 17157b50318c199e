use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry envelope for upstream calls: exponential backoff with optional
/// jitter, bounded by `max_retries` extra attempts (so `max_retries + 1`
/// attempts total).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Error indicators that make an upstream error retryable, matched
    /// case-insensitively against upstream error messages.
    #[serde(default = "default_retryable_indicators")]
    pub retryable_indicators: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_jitter() -> bool {
    true
}
fn default_retryable_indicators() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "econnrefused",
        "econnreset",
        "broken pipe",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            retryable_indicators: default_retryable_indicators(),
        }
    }
}

impl RetryPolicy {
    /// Whether the envelope may re-attempt after this error. Transport
    /// failures are always retryable; upstream JSON-RPC errors only when
    /// their message carries a configured indicator.
    pub fn is_retryable(&self, error: &GatewayError) -> bool {
        if error.is_retryable() {
            return true;
        }
        match error {
            GatewayError::Upstream { message, .. } => {
                let lowered = message.to_lowercase();
                self.retryable_indicators
                    .iter()
                    .any(|i| lowered.contains(&i.to_lowercase()))
            }
            _ => false,
        }
    }

    /// Backoff before re-attempt `attempt` (0-indexed):
    /// `min(base * multiplier^attempt, max)`, with up to ±25% uniform
    /// jitter when enabled. The pre-jitter sequence is non-decreasing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let raw = base * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        let with_jitter = if self.jitter {
            let factor = 1.0 + (rand::random::<f64>() - 0.5) * 0.5;
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(with_jitter.max(0.0) as u64)
    }

    /// Sleep the backoff, aborting early on cancellation. Returns
    /// `Err(Cancelled)` if the token fired first.
    pub async fn wait(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let delay = self.delay_for(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }
}
