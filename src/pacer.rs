//! Retry pacing for upstream calls
//!
//! One [`Pacer`] is shared by every upstream call a backend makes. Before each
//! attempt the pacer decides, under a short lock, when the attempt may start;
//! the lock is released before waiting and before the network call. A
//! retryable outcome widens the spacing between calls, a good outcome decays
//! it back towards the minimum. Under heavy concurrent failure this throttles
//! the whole backend, which is the point.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Retry bounds for upstream calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Spacing between calls when the upstream is healthy
    pub min_sleep: Duration,
    /// Upper bound on the spacing between calls
    pub max_sleep: Duration,
}

impl RetryPolicy {
    /// Create a retry policy with the default 10ms..2s pacing window
    pub fn new(max_retries: usize) -> Self {
        RetryPolicy {
            max_retries,
            min_sleep: Duration::from_millis(10),
            max_sleep: Duration::from_secs(2),
        }
    }

    /// Create a retry policy with an explicit pacing window
    pub fn with_sleep(max_retries: usize, min_sleep: Duration, max_sleep: Duration) -> Self {
        RetryPolicy {
            max_retries,
            min_sleep,
            max_sleep: max_sleep.max(min_sleep),
        }
    }

    /// Check if we should retry based on the attempt number and outcome
    pub fn should_retry(&self, attempt: usize, retryable: bool) -> bool {
        retryable && attempt < self.max_retries
    }

    /// Backoff after `attempt` consecutive failures: min_sleep * 2^attempt,
    /// capped at max_sleep
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31) as u32);
        self.min_sleep
            .saturating_mul(factor)
            .min(self.max_sleep)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(10)
    }
}

#[derive(Debug)]
struct PacerState {
    sleep: Duration,
    next_call: Instant,
}

/// Shared pacer implementing bounded exponential backoff
#[derive(Debug)]
pub struct Pacer {
    policy: RetryPolicy,
    state: Mutex<PacerState>,
    retries: AtomicU64,
}

impl Pacer {
    pub fn new(policy: RetryPolicy) -> Self {
        let state = PacerState {
            sleep: policy.min_sleep,
            next_call: Instant::now(),
        };
        Pacer {
            policy,
            state: Mutex::new(state),
            retries: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Total retries issued through this pacer
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Current spacing between calls
    pub async fn current_sleep(&self) -> Duration {
        self.state.lock().await.sleep
    }

    /// Run `op` until it succeeds, turns out not to be retryable, or the
    /// retry budget is spent. `should_retry` classifies each outcome.
    ///
    /// Returns the outcome of the last attempt.
    pub async fn call<T, F, Fut, P>(&self, mut op: F, should_retry: P) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
        P: Fn(&T) -> bool,
    {
        let mut attempt = 0;

        loop {
            self.begin_call().await;
            let outcome = op().await;
            let retryable = should_retry(&outcome);
            self.end_call(retryable).await;

            if !self.policy.should_retry(attempt, retryable) {
                if retryable {
                    warn!(
                        "Upstream call still failing after {} attempts, giving up",
                        attempt + 1
                    );
                }
                return outcome;
            }

            attempt += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Upstream call failed (attempt {}/{}), retrying",
                attempt,
                self.policy.max_retries + 1
            );
        }
    }

    async fn begin_call(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let start = state.next_call.max(now);
            state.next_call = start + state.sleep;
            start - now
        };

        if !wait.is_zero() {
            debug!("Pacer waiting {:?} before upstream call", wait);
            sleep(wait).await;
        }
    }

    async fn end_call(&self, retryable: bool) {
        let mut state = self.state.lock().await;
        state.sleep = if retryable {
            (state.sleep * 2)
                .max(self.policy.min_sleep)
                .min(self.policy.max_sleep)
        } else {
            (state.sleep * 3 / 4).max(self.policy.min_sleep)
        };
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Pacer::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::with_sleep(max_retries, Duration::from_millis(1), Duration::from_millis(8))
    }

    #[test]
    fn test_retry_policy_new() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.min_sleep, Duration::from_millis(10));
        assert_eq!(policy.max_sleep, Duration::from_secs(2));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::new(3);

        assert!(policy.should_retry(0, true));
        assert!(policy.should_retry(2, true));
        assert!(!policy.should_retry(3, true));
        assert!(!policy.should_retry(0, false));
    }

    #[test]
    fn test_retry_policy_backoff_duration() {
        let policy = RetryPolicy::new(3);

        assert_eq!(policy.backoff_duration(0), Duration::from_millis(10));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(20));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(40));
        assert_eq!(policy.backoff_duration(40), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_call_stops_after_max_retries() {
        let pacer = Pacer::new(fast_policy(3));
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let outcome: std::result::Result<(), u16> = pacer
            .call(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(503)
                    }
                },
                |outcome| outcome.is_err(),
            )
            .await;

        assert_eq!(outcome, Err(503));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(pacer.retry_count(), 3);
    }

    #[tokio::test]
    async fn test_call_does_not_retry_terminal_outcome() {
        let pacer = Pacer::new(fast_policy(5));
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let outcome: std::result::Result<(), u16> = pacer
            .call(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(404)
                    }
                },
                |outcome| matches!(outcome, Err(status) if *status >= 500),
            )
            .await;

        assert_eq!(outcome, Err(404));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_recovers_after_transient_failures() {
        let pacer = Pacer::new(fast_policy(5));
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let outcome: std::result::Result<usize, u16> = pacer
            .call(
                || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        if n < 2 { Err(502) } else { Ok(n) }
                    }
                },
                |outcome| outcome.is_err(),
            )
            .await;

        assert_eq!(outcome, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sleep_widens_and_decays() {
        let pacer = Pacer::new(fast_policy(2));

        let _: std::result::Result<(), ()> = pacer.call(|| async { Err(()) }, |o| o.is_err()).await;
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(8));

        for _ in 0..10 {
            let _: std::result::Result<(), ()> = pacer.call(|| async { Ok(()) }, |o| o.is_err()).await;
        }
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(1));
    }
}
