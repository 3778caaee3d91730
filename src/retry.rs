//! Bounded retries for transient remote failures
//!
//! Remote calls inside poll loops (cluster status, deployment status, service
//! address) and idempotent cloud PUTs go through [`retry_transient`] so that a
//! network blip or a throttled request does not abort a fifteen-minute
//! provisioning wait. Only errors that [`Error::is_retryable`] classifies as
//! transient are retried; anything else surfaces on the first attempt.
//! Cancellation interrupts both the in-flight call and the backoff sleep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;

/// How many times, and how far apart, a transient failure is retried
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first; values below 1 behave as 1
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for each retry after it
    pub base_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Default delays with a custom attempt bound
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), jittered to 50-150%
    fn delay_before(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(16);
        let nominal = self
            .base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);
        nominal.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// Run `call`, retrying transient [`Error`]s up to `config.max_attempts` times
///
/// Returns [`Error::Cancelled`] as soon as `cancel` fires, whether a call is in
/// flight or the loop is waiting to retry.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    call_name: &str,
    mut call: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(call_name));
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(call_name)),
            result = call() => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= attempts {
            warn!(call = %call_name, attempts, error = %err, "Giving up on transient failure");
            return Err(err);
        }

        let delay = config.delay_before(attempt);
        debug!(
            call = %call_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(call_name)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
