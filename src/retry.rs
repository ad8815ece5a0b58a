//! Bounded retry schedules shared by order placement, fill polling and cancellation.

use std::future::Future;
use std::time::Duration;

use crate::exchange::ExchangeError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

/// Outcome of one polling round.
pub enum Attempt<T> {
    Done(T),
    Retry(String),
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy { max_attempts: max_attempts.max(1), backoff: Backoff::Fixed(delay) }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { initial, max },
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1 << shift).min(max)
            }
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempts run out.
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let mut delay = self.delay_for(attempt);
                    if let ExchangeError::RateLimit { retry_after } = &e {
                        delay = delay.max(*retry_after);
                    }
                    log::warn!(
                        "{}: {}, retry in {:?} ({}/{})",
                        label, e, delay, attempt, self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        log::error!("{}: giving up after {} attempts: {}", label, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Poll until `round` reports `Done`. `None` once every attempt came back `Retry`.
    pub async fn poll<F, Fut, T>(&self, label: &str, mut round: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        for attempt in 1..=self.max_attempts {
            match round().await {
                Attempt::Done(value) => return Some(value),
                Attempt::Retry(reason) => {
                    log::debug!("{}: attempt {}/{}: {}", label, attempt, self.max_attempts, reason);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
            }
        }
        log::warn!("{}: no result after {} attempts", label, self.max_attempts);
        None
    }
}
