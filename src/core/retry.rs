use crate::types::{S2Error, S2Result};
use std::time::Duration;

/// Retry schedule: `max_attempts` tries, sleeping `base * 2^(n-1)` (capped) between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Catalogue queries: base 1s, cap 32s, 5 attempts
    pub fn catalogue() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(32))
    }

    /// File transfers: one attempt plus 3 retries
    pub fn download() -> Self {
        Self::new(4, Duration::from_secs(2), Duration::from_secs(32))
    }

    /// No sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned unchanged.
    pub fn run<T, F, R>(&self, what: &str, mut op: F, retryable: R) -> S2Result<T>
    where
        F: FnMut(u32) -> S2Result<T>,
        R: Fn(&S2Error) -> bool,
    {
        let mut attempt = 1;
        loop {
            log::debug!("{}: attempt {} of {}", what, attempt, self.max_attempts);
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "{}: attempt {} failed ({}), retrying in {:?}",
                        what,
                        attempt,
                        e,
                        delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::catalogue()
    }
}
