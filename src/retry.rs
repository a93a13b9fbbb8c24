//! Retry policy shared by oracle calls and message delivery.
//!
//! A policy is just numbers: how many attempts, and how long to wait between
//! them. What counts as retryable is decided per call site through a predicate,
//! so the same policy type serves both "the oracle returned garbage" and
//! "the message never showed up in the pane".

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{BackoffKind, DeliveryConfig, MonitorConfig, OracleConfig};
use crate::olog_debug;

/// Upper bound on any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause before every retry.
    Fixed(Duration),
    /// `initial * 2^(attempt-1)`, capped at [`MAX_BACKOFF`].
    Exponential { initial: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Final result of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn for_oracle(config: &OracleConfig) -> Self {
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(config.retry_delay()),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: config.retry_delay(),
            },
        };
        Self::new(config.max_attempts, backoff)
    }

    /// Delivery attempts are spaced by the settle wait inside each attempt,
    /// so no extra pause is added between them.
    pub fn for_delivery(config: &DeliveryConfig) -> Self {
        Self::fixed(config.max_attempts, Duration::ZERO)
    }

    pub fn for_session_read(config: &MonitorConfig) -> Self {
        Self::fixed(config.session_read_attempts, config.session_read_retry_delay())
    }

    /// Pause after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << shift).min(MAX_BACKOFF)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `op` receives the 1-based attempt number.
    ///
    /// Once `cancel` fires no further attempt is started and the last error is
    /// returned. An attempt already running is left to finish.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        is_retryable: R,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(err) => err,
            };
            if attempt >= self.max_attempts || !is_retryable(&err) || cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
            let delay = self.delay_after(attempt);
            olog_debug!(
                "retry: attempt {}/{} failed ({}), next in {:?}",
                attempt,
                self.max_attempts,
                err,
                delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    olog_debug!("retry: cancelled after attempt {}", attempt);
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
