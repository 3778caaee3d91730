//! Bounded polling with deadlines and cancellation
//!
//! Every long wait in the pipeline (cluster provisioning, workload readiness,
//! external address assignment) is a [`poll_until`] loop. Reaching the deadline
//! is not an error here: the caller decides whether a timeout is fatal
//! (provisioning) or a degraded success (readiness).

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Timeout and interval for a poll loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    /// Overall deadline, measured from the first check
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Delay between checks
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl PollConfig {
    /// Create a poll config
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// A config that checks exactly once
    pub const fn once() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

/// Result of a poll loop that did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value before the deadline
    Ready(T),
    /// The deadline passed without the check producing a value
    TimedOut,
}

/// Poll `check` until it yields `Some`, the deadline passes, or `cancel` fires.
///
/// `check` returns `Ok(Some(v))` when the awaited condition holds, `Ok(None)` to
/// keep polling, or `Err` to abort the loop. Cancellation is observed before
/// each check, while a check is running and while sleeping between checks.
pub async fn poll_until<T, F, Fut>(
    config: &PollConfig,
    operation: &str,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<PollOutcome<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        let checked = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            checked = check() => checked?,
        };
        if let Some(value) = checked {
            return Ok(PollOutcome::Ready(value));
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Ok(PollOutcome::TimedOut);
        }

        trace!(operation = %operation, elapsed_ms = elapsed.as_millis(), "condition not yet met");

        let remaining = config.timeout - elapsed;
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(config.interval.min(remaining)) => {}
        }
    }
}

/// Serde helper for durations expressed as whole seconds in config files
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as seconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    /// Deserialize a duration from seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
