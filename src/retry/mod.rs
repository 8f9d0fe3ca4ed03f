//! Retry harness
//!
//! Runs an async operation until it succeeds, the attempt budget runs out,
//! a hook gives up, or the cancellation token fires. Nothing is retried by
//! default: a fresh [`Retry`] makes exactly one attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod policy;

/// Returned (through `E: From<Cancelled>`) when the token fires before or
/// between attempts.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Longest delay [`backoff`] grows to, before jitter
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type AttemptsFn<'a, E> = Box<dyn FnMut(u32, u32, &E) -> u32 + Send + 'a>;
type DelayFn<'a, E> = Box<dyn FnMut(u32, Duration, &E) -> Duration + Send + 'a>;
type OnRetryFn<'a, E> = Box<dyn FnMut(u32, &E) -> Result<(), E> + Send + 'a>;
type RetryIfFn<'a, E> = Box<dyn FnMut(u32, &E) -> bool + Send + 'a>;

/// Retry policy builder
///
/// Hooks receive the 1-based number of the attempt that just failed.
///
/// # Example
///
/// ```
/// use b2_engine::retry::{Cancelled, Retry};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Debug)]
/// enum Failure { Busy, Cancelled }
///
/// impl From<Cancelled> for Failure {
///     fn from(_: Cancelled) -> Self { Failure::Cancelled }
/// }
///
/// # tokio_test::block_on(async {
/// let ctx = CancellationToken::new();
/// let value = Retry::new()
///     .attempts(3)
///     .delay(Duration::from_millis(1))
///     .run(&ctx, |attempt| async move {
///         if attempt < 3 { Err(Failure::Busy) } else { Ok(attempt) }
///     })
///     .await
///     .unwrap();
/// assert_eq!(value, 3);
/// # });
/// ```
pub struct Retry<'a, E> {
    attempts: u32,
    delay: Duration,
    dynamic_attempts: Option<AttemptsFn<'a, E>>,
    dynamic_delay: Option<DelayFn<'a, E>>,
    on_retry: Option<OnRetryFn<'a, E>>,
    retry_if: Option<RetryIfFn<'a, E>>,
}

impl<E> Default for Retry<'_, E> {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
            dynamic_attempts: None,
            dynamic_delay: None,
            on_retry: None,
            retry_if: None,
        }
    }
}

impl<'a, E> Retry<'a, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts, including the first. Zero means no limit.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Wait between attempts
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Recompute the attempt limit from `(attempt, current limit, error)`.
    pub fn dynamic_attempts<F>(mut self, f: F) -> Self
    where
        F: FnMut(u32, u32, &E) -> u32 + Send + 'a,
    {
        self.dynamic_attempts = Some(Box::new(f));
        self
    }

    /// Recompute the wait from `(attempt, previous wait, error)`.
    pub fn dynamic_delay<F>(mut self, f: F) -> Self
    where
        F: FnMut(u32, Duration, &E) -> Duration + Send + 'a,
    {
        self.dynamic_delay = Some(Box::new(f));
        self
    }

    /// Called before every wait. Returning an error stops the loop with it.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: FnMut(u32, &E) -> Result<(), E> + Send + 'a,
    {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Stop early when this returns false.
    pub fn retry_if<F>(mut self, f: F) -> Self
    where
        F: FnMut(u32, &E) -> bool + Send + 'a,
    {
        self.retry_if = Some(Box::new(f));
        self
    }

    /// Run `op`, passing it the 1-based attempt number.
    pub async fn run<T, F, Fut>(mut self, ctx: &CancellationToken, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Cancelled>,
    {
        if ctx.is_cancelled() {
            return Err(Cancelled.into());
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(f) = self.dynamic_attempts.as_mut() {
                self.attempts = f(attempt, self.attempts, &err);
            }
            if self.attempts != 0 && attempt >= self.attempts {
                return Err(err);
            }
            if let Some(f) = self.retry_if.as_mut() {
                if !f(attempt, &err) {
                    return Err(err);
                }
            }
            if let Some(f) = self.on_retry.as_mut() {
                f(attempt, &err)?;
            }
            if let Some(f) = self.dynamic_delay.as_mut() {
                self.delay = f(attempt, self.delay, &err);
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}

/// Roughly 2% of `d`, itself perturbed by up to half its size either way.
pub fn jitter(d: Duration) -> Duration {
    let base = d.as_secs_f64() / 50.0;
    let perturbed = base + base * (rand::rng().random::<f64>() - 0.5);
    Duration::from_secs_f64(perturbed.max(0.0))
}

/// Next wait after `d`: doubled, capped at [`MAX_BACKOFF`], plus jitter.
pub fn backoff(d: Duration) -> Duration {
    if d > MAX_BACKOFF {
        return MAX_BACKOFF + jitter(d);
    }
    let doubled = d * 2;
    doubled + jitter(doubled)
}
