//! Fixed back-off schedules for calls to external services.
//!
//! A [`Backoff`] is a plain list of delays. [`retry`] makes one initial
//! attempt and then one more attempt per entry, sleeping that entry's delay
//! first. Sleeping goes through a [`Sleeper`] so tests can record delays
//! instead of waiting for them.

use async_trait::async_trait;
use eyre::Result;
use std::future::Future;
use std::time::Duration;

/// Ordered list of delays between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: delays.into_iter().collect(),
        }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs))
    }

    /// Schedule for JSON-RPC calls to an Ethereum node.
    pub fn rpc() -> Self {
        Self::from_secs(&[1, 3, 5, 10, 20, 30, 60])
    }

    /// Schedule for historical `eth_call` contract reads.
    pub fn contract_call() -> Self {
        Self::from_secs(&[0, 2, 5, 10, 30])
    }

    /// Schedule for rate-limited block explorer requests.
    pub fn explorer() -> Self {
        Self::from_secs(&[1, 3, 10, 30, 60])
    }

    /// No retries at all; the first failure is final.
    pub fn none() -> Self {
        Self::new([])
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.delays.iter().copied()
    }

    /// Total number of attempts this schedule allows.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

/// Abstraction over `tokio::time::sleep`.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Returned when every attempt allowed by a [`Backoff`] failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("exceeded retries after {attempts} attempts: {last_error}")]
    ExceededRetries { attempts: usize, last_error: String },
}

/// Runs `op` until it succeeds, `is_fatal` accepts its error, or the
/// schedule runs out.
///
/// Fatal errors are returned unchanged. Exhaustion is reported as
/// [`RetryError::ExceededRetries`].
///
/// # Errors
/// Returns the fatal error, or `RetryError` when all attempts failed.
pub async fn retry<T, F, Fut>(
    backoff: &Backoff,
    sleeper: &dyn Sleeper,
    mut op: F,
    is_fatal: impl Fn(&eyre::Report) -> bool,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = backoff.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if is_fatal(&err) {
            return Err(err);
        }

        match delays.next() {
            Some(delay) => {
                tracing::debug!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                sleeper.sleep(delay).await;
            }
            None => {
                tracing::error!(attempts, error = %err, "exceeded retries");
                return Err(RetryError::ExceededRetries {
                    attempts,
                    last_error: err.to_string(),
                }
                .into());
            }
        }
    }
}
