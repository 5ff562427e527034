use std::fmt;
use std::future::Future;
use std::time;

use thiserror::Error;
use tracing::{debug, warn};

use crate::classify::{Classify, ErrorClass};

pub const RETRY_ATTEMPTS: &str = "pipeline_retry_attempts_total";
pub const RETRY_OUTCOMES: &str = "pipeline_retry_outcomes_total";

#[derive(Copy, Clone, Debug)]
/// The retry policy applied around broker and store operations.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// How many times an operation is retried after its first try. 0 disables retrying.
    max_retries: u32,
}

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("{0}")]
    Fatal(E),
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(error) => error,
            RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Fatal(error) => error,
            RetryError::Exhausted { error, .. } => error,
        }
    }

    /// Total number of tries made, including the first one.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal(_) => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn class(&self) -> ErrorClass {
        self.inner().class()
    }
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// A policy that tries each operation exactly once.
    pub fn no_retries() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Calculate the time until the next retry, given how many retries already happened.
    pub fn time_until_next_retry(&self, retries: u32) -> time::Duration {
        let interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(retries));

        match self.maximum_interval {
            Some(maximum_interval) => interval.min(maximum_interval),
            None => interval,
        }
    }

    /// Run `f` until it succeeds, fails with a fatal error, or runs out of retries.
    ///
    /// Only errors classified as transient are retried. Between tries we sleep for
    /// `initial_interval * backoff_coefficient^retry`, so with the defaults an operation that
    /// never succeeds gives up after 1s + 2s + 4s of sleeping.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries: u32 = 0;

        loop {
            let error = match f().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(operation, retries, "operation succeeded after retrying");
                        metrics::counter!(RETRY_OUTCOMES, "operation" => operation.to_owned(), "outcome" => "recovered")
                            .increment(1);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.class() == ErrorClass::Fatal {
                warn!(operation, error = %error, "fatal error, not retrying");
                metrics::counter!(RETRY_OUTCOMES, "operation" => operation.to_owned(), "outcome" => "fatal")
                    .increment(1);
                return Err(RetryError::Fatal(error));
            }

            if retries >= self.max_retries {
                warn!(
                    operation,
                    attempts = retries + 1,
                    error = %error,
                    "transient error, retries exhausted"
                );
                metrics::counter!(RETRY_OUTCOMES, "operation" => operation.to_owned(), "outcome" => "exhausted")
                    .increment(1);
                return Err(RetryError::Exhausted {
                    attempts: retries + 1,
                    error,
                });
            }

            let delay = self.time_until_next_retry(retries);
            retries += 1;

            warn!(
                operation,
                retry = retries,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient error, retrying"
            );
            metrics::counter!(RETRY_ATTEMPTS, "operation" => operation.to_owned()).increment(1);

            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                TestError::Flaky => write!(f, "connection reset"),
                TestError::Broken => write!(f, "authentication failed"),
            }
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            match self {
                TestError::Flaky => ErrorClass::Transient,
                TestError::Broken => ErrorClass::Fatal,
            }
        }
    }

    #[test]
    fn test_time_until_next_retry() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.time_until_next_retry(0), Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(2), Duration::from_secs(4));

        let capped = RetryPolicy::new(2, Duration::from_secs(1), Some(Duration::from_secs(3)));
        assert_eq!(capped.time_until_next_retry(0), Duration::from_secs(1));
        assert_eq!(capped.time_until_next_retry(5), Duration::from_secs(3));
    }

    #[test]
    fn test_time_until_next_retry_saturates() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.time_until_next_retry(64),
            Duration::from_secs(u64::from(u32::MAX))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();

        let result = RetryPolicy::default()
            .execute("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = RetryPolicy::default()
            .execute("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

        let error = result.unwrap_err();
        assert!(error.is_exhausted());
        assert_eq!(error.attempts(), 4);
        assert_eq!(error.into_inner(), TestError::Flaky);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = RetryPolicy::default()
            .execute("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Broken)
            })
            .await;

        let error = result.unwrap_err();
        assert!(matches!(error, RetryError::Fatal(TestError::Broken)));
        assert_eq!(error.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_tries_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = RetryPolicy::no_retries()
            .execute("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
