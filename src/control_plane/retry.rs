use std::future::Future;
use std::time::Duration;

use crate::Error;

/// Retry budget of a control-plane call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each following one
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Failure of a single attempt
#[derive(Debug)]
pub(crate) enum Attempt {
    /// Worth another try
    Retry(Error),
    /// Retrying won't change the answer
    Abort(Error),
}

impl From<Error> for Attempt {
    fn from(e: Error) -> Self {
        if e.is_transient() {
            Self::Retry(e)
        } else {
            Self::Abort(e)
        }
    }
}

/// Why [`RetryPolicy::run`] gave up
#[derive(Debug)]
pub(crate) enum GaveUp {
    /// Every attempt failed transiently
    Exhausted { attempts: u32, last: Error },
    /// An attempt failed for good
    Aborted(Error),
}

impl RetryPolicy {
    /// Attempts made before giving up
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry`, counting from 1
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Sum of all backoff delays, not counting the attempts themselves
    #[must_use]
    pub fn max_total_delay(&self) -> Duration {
        (1..=self.max_retries).map(|retry| self.delay_for(retry)).sum()
    }

    /// Run `op` until it succeeds, aborts, or the budget is spent. `op` gets the attempt number.
    pub(crate) async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, GaveUp>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Attempt>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(Attempt::Abort(e)) => return Err(GaveUp::Aborted(e)),
                Err(Attempt::Retry(e)) if attempt >= self.max_attempts() => {
                    return Err(GaveUp::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(Attempt::Retry(e)) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        "attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        self.max_attempts(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
