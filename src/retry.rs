//! Bounded retry with exponential backoff.
//!
//! Used for the three places the relay calls something that can fail
//! transiently:
//!
//! - the upstream status check inside a retry coordinator (bounded attempts
//!   plus an absolute deadline),
//! - the notify sink inside a throttler (capped attempts, slow growth),
//! - instance start-up inside the singleton scheduler (fixed delay).
//!
//! Only transient errors are retried. Permanent errors are returned immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Errors that know whether retrying them can help.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff. `1.0` gives a fixed delay.
    pub backoff_multiplier: f64,

    /// Absolute bound on the whole retry loop, measured from the first call.
    /// A retry whose delay would cross this bound is not attempted.
    pub max_elapsed: Option<Duration>,
}

impl RetryConfig {
    /// Upstream status check: 5 retries from 5s, capped at 60s, 10 minutes overall.
    pub const STATUS_CHECK: Self = Self {
        max_retries: 5,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 2.0,
        max_elapsed: Some(Duration::from_secs(600)),
    };

    /// Notify sink: 3 retries from 10s, growing by half each time, capped at 2 minutes.
    pub const NOTIFY: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(120),
        backoff_multiplier: 1.5,
        max_elapsed: None,
    };

    /// Instance start-up: 3 retries, 2s apart.
    pub const START: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 1.0,
        max_elapsed: None,
    };

    /// Creates a new retry configuration without an overall deadline.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            max_elapsed: None,
        }
    }

    /// Creates a fixed-delay configuration.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, delay, delay, 1.0)
    }

    /// Sets an absolute bound on the retry loop.
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Computes the delay for the given retry attempt (0-indexed).
    ///
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::STATUS_CHECK
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded.
    Success(T),

    /// A transient error persisted past the attempt bound or the deadline.
    ExhaustedRetries {
        /// The last error encountered.
        last_error: E,
        /// Number of attempts made (including the initial attempt).
        attempts: u32,
    },

    /// A permanent error occurred (not retriable).
    PermanentError(E),
}

/// Executes an async operation with retry logic.
///
/// The operation is retried according to `config` while it returns a
/// transient error. Permanent errors are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: RetryConfig,
    mut operation: F,
) -> RetryResult<T, E>
where
    E: Transience,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    let max_attempts = config.max_retries.saturating_add(1);

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => {
                attempt += 1;

                if !e.is_transient() {
                    return RetryResult::PermanentError(e);
                }

                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }

                let delay = config.delay_for_attempt(attempt - 1);
                if let Some(max_elapsed) = config.max_elapsed
                    && started.elapsed() + delay > max_elapsed
                {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl Transience for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn delays(config: &RetryConfig) -> Vec<Duration> {
        (0..config.max_retries)
            .map(|attempt| config.delay_for_attempt(attempt))
            .collect()
    }

    // ─── Unit Tests ───────────────────────────────────────────────────────────

    #[test]
    fn start_delays_are_fixed() {
        let delays: Vec<_> = delays(&RetryConfig::START);
        assert_eq!(delays, vec![Duration::from_secs(2); 3]);
    }

    #[test]
    fn notify_delays_grow_slowly() {
        let delays: Vec<_> = delays(&RetryConfig::NOTIFY);
        assert_eq!(delays[0], Duration::from_secs(10));
        assert_eq!(delays[1], Duration::from_secs(15));
        assert_eq!(delays[2], Duration::from_secs_f64(22.5));
    }

    #[test]
    fn status_check_delays_respect_cap() {
        let delays: Vec<_> = delays(&RetryConfig::STATUS_CHECK);
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        assert_eq!(delays[3], Duration::from_secs(40));
        assert_eq!(delays[4], Duration::from_secs(60));
    }

    #[tokio::test]
    async fn retry_success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(RetryConfig::START, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(42) }
        })
        .await;

        assert!(matches!(result, RetryResult::Success(42)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_permanent_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(RetryConfig::START, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TestError::Permanent) }
        })
        .await;

        assert!(matches!(result, RetryResult::PermanentError(TestError::Permanent)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transient_succeeds_on_third_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(RetryConfig::START, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(matches!(result, RetryResult::Success(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transient_exhausts_retries() {
        let config = RetryConfig::fixed(2, Duration::from_secs(1));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(config, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TestError::Transient) }
        })
        .await;

        match result {
            RetryResult::ExhaustedRetries { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected ExhaustedRetries, got {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn max_elapsed_cuts_retries_short() {
        // 10 retries of 60s each would take 10 minutes; the 150s bound allows
        // the initial call plus two retries.
        let config = RetryConfig::fixed(10, Duration::from_secs(60))
            .with_max_elapsed(Duration::from_secs(150));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(config, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TestError::Transient) }
        })
        .await;

        match result {
            RetryResult::ExhaustedRetries { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected ExhaustedRetries, got {:?}", other),
        }
    }

    // ─── Property Tests ───────────────────────────────────────────────────────

    proptest! {
        #[test]
        fn delay_sequence_is_monotonic_and_capped(
            initial_ms in 1u64..1000,
            max_ms in 1000u64..60000,
            multiplier in 1.0f64..3.0,
            max_retries in 1u32..15,
        ) {
            let config = RetryConfig::new(
                max_retries,
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                multiplier,
            );

            let delays: Vec<_> = delays(&config);
            for window in delays.windows(2) {
                prop_assert!(window[1] >= window[0], "Delays should be monotonic");
            }
            for delay in &delays {
                prop_assert!(*delay <= Duration::from_millis(max_ms));
            }
        }
    }
}
