//! Retry policy with exponential backoff and jitter.
//!
//! The policy is a plain value: callers hold one, pass it to [`retry_async`],
//! and nothing about backoff is shared between files.

use crate::cancel::CancellationToken;
use crate::config::TransferSettings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently to retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Multiply each delay by a random factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: TransferSettings::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(TransferSettings::DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(TransferSettings::DEFAULT_MAX_DELAY_MS),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: 2.0,
            jitter: settings.jitter,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let max_secs = self.max_delay.as_secs_f64();
        let capped_secs = (self.base_delay.as_secs_f64() * factor).min(max_secs);

        let final_secs = if self.jitter {
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(max_secs)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs.max(0.0))
    }
}

/// What happened while retrying.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay slept between attempts.
    pub total_delay: Duration,
    pub success: bool,
    /// Retrying stopped because the run was cancelled.
    pub cancelled: bool,
    pub last_error: Option<String>,
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, exhausts the policy, or `cancel` fires.
///
/// Cancellation never interrupts an attempt in progress. It only prevents the
/// next one, including while waiting out a backoff delay.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err = match operation(attempt).await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Error is not retryable: {}", err);
            return (Err(err), stats);
        }

        if attempt + 1 >= max_attempts {
            warn!(
                "All {} attempts exhausted. Last error: {}",
                max_attempts, err
            );
            return (Err(err), stats);
        }

        if cancel.is_some_and(|c| c.is_cancelled()) {
            stats.cancelled = true;
            return (Err(err), stats);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {
                        debug!("Retry wait interrupted by cancellation");
                        stats.cancelled = true;
                        return (Err(err), stats);
                    }
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        stats.total_delay += delay;
        attempt += 1;
    }
}
