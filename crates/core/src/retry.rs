//! Bounded retry with a per-attempt delay schedule.
//!
//! The delay before attempt `i > 0` is `delays[min(i - 1, len - 1)]`; the
//! last delay is reused when the schedule is shorter than the attempt
//! count. Sleeps race against a cancellation token so an abandoned job
//! never waits out a backoff.

use crate::error::Error;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error returned by [`RetryPolicy::run`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    #[error("retry cancelled: operation aborted")]
    Cancelled,
}

/// A bounded retry policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Build a policy. The attempt count must be positive and the delay
    /// schedule non-empty.
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> crate::Result<Self> {
        if max_attempts == 0 {
            return Err(Error::Config(
                "retry max_attempts must be positive".to_string(),
            ));
        }
        if delays.is_empty() {
            return Err(Error::Config(
                "retry delay schedule must not be empty".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            delays,
        })
    }

    /// Network defaults: 3 attempts at 100 ms / 1 s / 10 s.
    pub fn network_defaults() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_secs(10),
            ],
        }
    }

    /// Block-storage defaults: 2 attempts at 100 ms / 1 s.
    pub fn block_defaults() -> Self {
        Self {
            max_attempts: 2,
            delays: vec![Duration::from_millis(100), Duration::from_secs(1)],
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds, attempts are exhausted, or `cancel`
    /// fires during a backoff sleep.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            if attempt > 0 {
                let idx = ((attempt - 1) as usize).min(self.delays.len() - 1);
                tokio::select! {
                    _ = tokio::time::sleep(self.delays[idx]) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => last_err = Some(e),
            }
        }
        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            source: last_err.expect("at least one attempt ran"),
        })
    }
}

/// Parse a retry schedule from environment-style strings.
///
/// `backoff` is a comma-separated list of millisecond delays; entries that
/// fail to parse or are not positive are skipped, and an empty result
/// falls back to `defaults`. An attempt count of zero likewise falls back.
pub fn schedule_from_env(attempts: u32, backoff: &str, defaults: &RetryPolicy) -> RetryPolicy {
    let delays: Vec<Duration> = backoff
        .split(',')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .collect();

    let max_attempts = if attempts > 0 {
        attempts
    } else {
        defaults.max_attempts
    };
    let delays = if delays.is_empty() {
        defaults.delays.clone()
    } else {
        delays
    };

    RetryPolicy {
        max_attempts,
        delays,
    }
}
