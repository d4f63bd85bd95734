//! Reconnection policy with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a transport re-establishes a dropped connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Give up after this many attempts (None = keep trying).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Sets the first retry delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub const fn should_reconnect(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Outcome of [`reconnect_with_backoff`].
#[derive(Debug)]
pub enum Reconnect<T, E> {
    /// A connection attempt succeeded.
    Connected(T),
    /// The attempt limit was reached; carries the last error.
    GaveUp(E),
    /// The token was cancelled while waiting.
    Cancelled,
}

/// Retries `connect_fn` with exponential backoff until it succeeds, the
/// attempt limit is reached, or `cancel` fires.
pub async fn reconnect_with_backoff<F, Fut, T, E>(
    config: &ReconnectConfig,
    cancel: &CancellationToken,
    mut connect_fn: F,
) -> Reconnect<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = tokio::select! {
            () = cancel.cancelled() => return Reconnect::Cancelled,
            result = connect_fn() => result,
        };

        match result {
            Ok(value) => {
                debug!(attempt, "reconnected");
                return Reconnect::Connected(value);
            }
            Err(e) => {
                if !config.should_reconnect(attempt) {
                    return Reconnect::GaveUp(e);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "reconnect attempt failed");
                tokio::select! {
                    () = cancel.cancelled() => return Reconnect::Cancelled,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
