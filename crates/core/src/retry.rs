//! Exponential backoff, used in two places:
//!
//! - between a failed attempt and the next claim of the same job
//!   ([`RetryPolicy`]), and
//! - around transient store operations inside repository and artifact
//!   store implementations ([`retry_transient`]).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::job::{Job, JobError, JobTransition};
use crate::types::Timestamp;

/// Default number of tries for a transient store operation.
pub const DEFAULT_STORE_TRIES: u32 = 3;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Short delays for local store retries.
    pub fn for_store() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !ms.is_finite() || ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(ms as u64)
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`BackoffPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &BackoffPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// How many times a job may run and how long to wait between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn has_attempts_left(&self, attempt_count: i32) -> bool {
        attempt_count < 0 || (attempt_count as u32) < self.max_attempts
    }

    /// Transition for a running job whose current attempt failed.
    ///
    /// Requeues with backoff while attempts remain, otherwise fails the job
    /// with `error` as the final error.
    pub fn on_failure(&self, job: &Job, error: JobError, now: Timestamp) -> JobTransition {
        if self.has_attempts_left(job.attempt_count) {
            let delay = self
                .backoff
                .delay_for_attempt(job.attempt_count.max(1) as u32);
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            JobTransition::Requeue {
                not_before: now + delay,
            }
        } else {
            JobTransition::Fail { error }
        }
    }
}

/// Run `op`, retrying with backoff while `is_transient` says the error is
/// worth another try, up to `max_tries` total calls.
pub async fn retry_transient<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    max_tries: u32,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_tries && is_transient(&e) => {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying",
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
