//! Retry policy shared by all workers
//!
//! Exponential backoff 1, 2, 4, 8, 16, 30 seconds (configurable cap), at
//! most `max_attempts` tries per retryable failure. A server that is
//! unreachable is not counted against the budget: the call blocks polling
//! the health endpoint until reachability returns, then resumes with a
//! fresh budget. Cancellation always preempts retry.

use std::time::Duration;

use tracing::{info, warn};

use esync_remote::api::{ApiError, RemoteApi};

use crate::transfer::CancelFlag;

/// Seconds between health checks while waiting for the network
const NETWORK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared exponential backoff policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per retryable failure
    pub max_attempts: u32,
    /// Cap on the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("cancelled while retrying")]
    Cancelled,
    #[error(transparent)]
    Api(ApiError),
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): 1, 2, 4, 8, 16, 30,
    /// then the cap.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = match 1u64.checked_shl(attempt) {
            Some(d) if d <= 16 => d,
            _ => 30,
        };
        Duration::from_secs(secs).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts the retry
    /// budget, or is cancelled. Unreachable-network failures switch to
    /// indefinite wait-for-network instead of consuming the budget.
    ///
    /// # Errors
    /// `RetryError::Api` with the last error, or `RetryError::Cancelled`.
    pub fn run<T>(
        &self,
        cancel: &CancelFlag,
        remote: &dyn RemoteApi,
        mut operation: impl FnMut() -> Result<T, ApiError>,
    ) -> Result<T, RetryError> {
        let mut attempt = 0u32;

        loop {
            if cancel.is_set() {
                return Err(RetryError::Cancelled);
            }

            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unreachable() => {
                    warn!(error = %err, "server unreachable, waiting for network");
                    if !wait_for_network(remote, cancel) {
                        return Err(RetryError::Cancelled);
                    }
                    // Reachability restored: fresh budget
                    attempt = 0;
                }
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(error = %err, attempts = attempt, "retry budget exhausted");
                        return Err(RetryError::Api(err));
                    }
                    let delay = self.delay(attempt - 1);
                    warn!(error = %err, attempt, delay_secs = delay.as_secs(), "retrying");
                    if !sleep_cancellable(delay, cancel) {
                        return Err(RetryError::Cancelled);
                    }
                }
                Err(err) => return Err(RetryError::Api(err)),
            }
        }
    }
}

/// Block until the server answers health checks again. Returns `false` if
/// cancelled first.
pub fn wait_for_network(remote: &dyn RemoteApi, cancel: &CancelFlag) -> bool {
    loop {
        if !sleep_cancellable(NETWORK_CHECK_INTERVAL, cancel) {
            return false;
        }
        if remote.health_check() {
            info!("network restored");
            return true;
        }
    }
}

/// Sleep in slices, aborting early on cancellation. Returns `false` when
/// cancelled.
pub fn sleep_cancellable(total: Duration, cancel: &CancelFlag) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_set() {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !cancel.is_set()
}
