use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How one attempt ended when it did not succeed.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Worth another try after the backoff.
    Retryable(E),
    /// Stop immediately, no further attempts.
    Fatal(E),
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    Fatal(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Fatal(err) => write!(f, "{err}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Bounded retry with linear backoff.
///
/// An operation gets one initial attempt plus at most `max_retries` more.
/// Between attempts the policy sleeps `backoff_step * (retry + 1)`.
/// `attempt_timeout` is not applied by [`RetryPolicy::run`] itself; attempts
/// bound their own waits with [`RetryPolicy::bounded`] so that only the part
/// worth timing out is timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_step.saturating_mul(retry.saturating_add(1))
    }

    pub async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, tokio::time::error::Elapsed> {
        tokio::time::timeout(self.attempt_timeout, fut).await
    }

    /// Runs `attempt(n)` for n = 0, 1, ... until it succeeds, fails fatally,
    /// or the retry budget is spent.
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
        E: fmt::Display,
    {
        let mut retry = 0u32;
        loop {
            match attempt(retry).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(err)) => return Err(RetryError::Fatal(err)),
                Err(AttemptError::Retryable(err)) => {
                    if retry >= self.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: retry + 1,
                            last: err,
                        });
                    }
                    let delay = self.backoff(retry);
                    debug!(retry = retry + 1, ?delay, error = %err, "attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}
