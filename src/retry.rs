//! Transient-error retry and cooperative cancellation.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// How often, and how patiently, contended storage work is re-run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before the first retry. Each later retry waits one more step.
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            min_wait,
            max_wait: max_wait.max(min_wait),
        }
    }

    /// Retry without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Wait before retry number `retry` (1-based).
    pub fn wait_before(&self, retry: u32) -> Duration {
        self.min_wait
            .saturating_mul(retry.max(1))
            .min(self.max_wait)
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or has been
/// attempted `policy.max_attempts` times.
///
/// Only [`Error::is_transient`] failures are retried, after sleeping
/// [`RetryPolicy::wait_before`]; each retry re-executes the whole unit of
/// work. After the last attempt the transient error is returned to the caller.
pub fn retry_on_deadlock<T, F>(policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let wait = policy.wait_before(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "storage contention, retrying"
                );
                metrics::deadlock_retries().add(1, &[]);
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A stop flag with a wait handle, shared between the loop and whoever stops it.
///
/// Checked between queue entries and between retry waits. An in-flight
/// migration is never interrupted.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Block for up to `timeout`. Returns true if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

/// Keep retrying a write that must land even while the database is
/// unavailable, waiting `wait` on the stop signal between attempts.
///
/// Gives up when a stop is requested. Errors that retrying cannot fix (a
/// missing entry, an invalid transition) are returned immediately.
pub(crate) fn retry_until_stopped<F>(stop: &StopSignal, wait: Duration, mut f: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(e @ (Error::NotFound(_) | Error::InvalidTransition { .. })) => return Err(e),
            Err(e) => {
                tracing::error!(error = %e, "write failed, retrying");
                if stop.wait(wait) {
                    return Err(Error::Other(format!("abandoned after stop request: {e}")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn busy() -> Error {
        Error::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn retry_waits_grow_up_to_the_cap() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(policy.wait_before(1), Duration::from_secs(1));
        assert_eq!(policy.wait_before(2), Duration::from_secs(2));
        assert_eq!(policy.wait_before(4), Duration::from_secs(3));
        assert_eq!(RetryPolicy::immediate(3).wait_before(2), Duration::ZERO);
    }

    #[test]
    fn stop_wakes_a_waiter() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let handle = std::thread::spawn(move || remote.wait(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        stop.stop();
        assert!(handle.join().unwrap());
        assert!(stop.is_stopped());
    }

    #[test]
    fn wait_times_out_without_stop() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.wait(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn retry_until_stopped_gives_up_on_stop() {
        let stop = StopSignal::new();
        stop.stop();
        let mut calls = 0;
        let result = retry_until_stopped(&stop, Duration::from_millis(1), || {
            calls += 1;
            Err(busy())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_until_stopped_keeps_going_until_success() {
        let stop = StopSignal::new();
        let mut calls = 0;
        retry_until_stopped(&stop, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 { Err(busy()) } else { Ok(()) }
        })
        .unwrap();
        assert_eq!(calls, 3);
    }
}
