//! Bounded exponential-backoff retry for the transaction write path.
//!
//! Attempts are separated by `base, 2·base, 4·base, ...` with no jitter. With the
//! default policy (5 attempts, 1 s base) the waits are 1, 2, 4 and 8 seconds and
//! the doubling would reach 16 s at the next step; no wait follows the last attempt.
//! Waits go through a [`Sleeper`] and are interrupted by a [`CancelToken`], so
//! shutdown never completes a stale write.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use crate::error::{PipelineError, StoreError};

/// Default number of write attempts per batch.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default backoff unit.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Shared shutdown signal. Cloning yields a handle to the same signal.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every waiter.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for up to `timeout`. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// How the retry loop waits between attempts.
pub trait Sleeper: Send + Sync {
    /// Pause for `delay`. Returns `false` if `cancel` fired before the delay elapsed.
    fn sleep(&self, delay: Duration, cancel: &CancelToken) -> bool;
}

impl<T: Sleeper + ?Sized> Sleeper for Arc<T> {
    fn sleep(&self, delay: Duration, cancel: &CancelToken) -> bool {
        (**self).sleep(delay, cancel)
    }
}

/// Blocks the calling thread only; wakes early on cancellation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration, cancel: &CancelToken) -> bool {
        !cancel.wait_timeout(delay)
    }
}

/// Attempt budget and backoff unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after the `failed_attempt`-th failure (1-based): `base · 2^(n-1)`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    /// Every wait the policy can produce, in order (`max_attempts - 1` entries).
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.backoff(n)).collect()
    }
}

/// Run `op` until it succeeds, fails non-retryably, runs out of attempts, or
/// `cancel` fires. Returns the number of attempts used on success.
///
/// `op` receives the 1-based attempt number.
pub fn retry_store_write<F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    mut op: F,
) -> Result<u32, PipelineError>
where
    F: FnMut(u32) -> Result<(), StoreError>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match op(attempt) {
            Ok(()) => {
                debug!("store write succeeded on attempt {attempt}/{max}");
                return Ok(attempt);
            }
            Err(e) if !e.is_retryable() => {
                warn!("store write rejected on attempt {attempt}/{max}: {e}");
                return Err(PipelineError::Rejected(e));
            }
            Err(e) if attempt >= max => {
                warn!("store write failed on attempt {attempt}/{max}: {e}");
                return Err(PipelineError::RetriesExhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!("store write failed on attempt {attempt}/{max}: {e}; retrying in {delay:?}");
                if !sleeper.sleep(delay, cancel) {
                    return Err(PipelineError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}
