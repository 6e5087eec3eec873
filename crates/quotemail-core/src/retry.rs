//! Bounded retry with an injectable delay.

use std::cell::RefCell;
use std::time::Duration;

/// Waits between attempts. Tests inject [`RecordingDelay`] so no wall-clock
/// time passes.
pub trait Delay {
    fn wait(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn wait(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested waits instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingDelay {
    waits: RefCell<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.borrow().clone()
    }
}

impl Delay for RecordingDelay {
    fn wait(&self, duration: Duration) {
        self.waits.borrow_mut().push(duration);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `retries + 1`.
    pub retries: u32,
    pub interval: Duration,
}

#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.last, self.attempts)
    }
}

/// Run `op` until it succeeds, `retryable` rejects the error, or the policy
/// is exhausted. Returns the value together with the attempt count.
pub fn retry<T, E>(
    policy: RetryPolicy,
    delay: &dyn Delay,
    retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut(u32) -> std::result::Result<T, E>,
) -> std::result::Result<(T, u32), RetryError<E>> {
    let max_attempts = policy.retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                tracing::debug!(attempt, max_attempts, "attempt failed, retrying");
                delay.wait(policy.interval);
                attempt += 1;
            }
            Err(last) => {
                return Err(RetryError {
                    attempts: attempt,
                    last,
                })
            }
        }
    }
}
