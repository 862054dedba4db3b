//! Retry with exponential backoff for API requests.

use ferry_types::ApiError;
use rand::Rng;

/// How transient API failures are retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying).
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth of the delay per attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
        }
    }
}

/// Whether a failed request is worth sending again.
pub fn is_retryable(error: &ApiError) -> bool {
    matches!(
        error,
        ApiError::RateLimited { .. }
            | ApiError::Overloaded
            | ApiError::Server { .. }
            | ApiError::Network(_)
            | ApiError::Timeout
    )
}

/// Milliseconds to wait before retry number `attempt` (0-based).
///
/// A server-supplied `retry-after` wins, capped at `max_delay_ms`. Otherwise
/// the delay is `initial_delay_ms * backoff_factor^attempt` with ±25% jitter,
/// also capped.
pub fn calculate_delay(config: &RetryConfig, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
    if let Some(server_delay) = retry_after_ms {
        return server_delay.min(config.max_delay_ms);
    }

    let base = config.initial_delay_ms as f64 * config.backoff_factor.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.75..=1.25);
    let delay = base.min(config.max_delay_ms as f64) * jitter;
    (delay as u64).min(config.max_delay_ms)
}
