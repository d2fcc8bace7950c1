//! RetryEngine - bounded retry with exponential backoff
//!
//! `execute_with_retry` runs an operation in an explicit loop. Each failure
//! is classified, checked against the policy, and followed by a
//! cancellation-aware wait before the next attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use af_common::{ClassifiedError, ErrorKind};
use af_config::RetryConfig;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Custom retry decision, given the failure and the attempt that produced it
pub type RetryPredicate = Arc<dyn Fn(&ClassifiedError, u32) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Replaces the default kind-based decision when set
    pub retry_predicate: Option<RetryPredicate>,
    /// Use the server's Retry-After for RateLimited failures
    pub respect_retry_after: bool,
    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A single attempt
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            retry_predicate: None,
            respect_retry_after: config.respect_retry_after,
            jitter: config.jitter,
        }
    }

    pub fn with_backoff(mut self, base: Duration, multiplier: f64, max: Duration) -> Self {
        self.base_delay = base;
        self.backoff_multiplier = multiplier;
        self.max_delay = max;
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ClassifiedError, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// `min(base * multiplier^(attempt-1), max)` for 1-based attempts
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= max {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    /// Whether the failure of `attempt` should be followed by another attempt
    pub fn should_retry(&self, error: &ClassifiedError, attempt: u32) -> bool {
        if attempt >= self.max_attempts || error.kind == ErrorKind::Aborted {
            return false;
        }
        match &self.retry_predicate {
            Some(predicate) => predicate(error, attempt),
            None => error.retryable,
        }
    }

    /// Wait before the attempt after `attempt`
    pub fn next_delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        if self.respect_retry_after && error.kind == ErrorKind::RateLimited {
            if let Some(hint) = error.retry_after {
                return hint;
            }
        }
        let delay = self.delay_for_attempt(attempt);
        if self.jitter && !delay.is_zero() {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            return delay.mul_f64(factor);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("retry_predicate", &self.retry_predicate.as_ref().map(|_| "custom"))
            .field("respect_retry_after", &self.respect_retry_after)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub http_status: Option<u16>,
    /// Wait scheduled after this failure, `None` when it was final
    pub delay: Option<Duration>,
}

/// Bookkeeping for a single `execute_with_retry` call
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Option<Duration>,
    pub history: Vec<AttemptRecord>,
}

impl RetryState {
    fn record(&mut self, error: &ClassifiedError, delay: Option<Duration>) {
        self.next_delay = delay;
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            kind: error.kind,
            http_status: error.http_status,
            delay,
        });
    }

    /// Annotate the surfacing error with the attempt count and history
    fn finish(mut self, error: ClassifiedError) -> ClassifiedError {
        self.record(&error, None);
        debug!(
            attempts = self.attempt,
            kind = %error.kind,
            history = ?self.history,
            "Retry loop finished with failure"
        );
        let mut error = error.with_attempts(self.attempt);
        if self.history.len() > 1 {
            let trail = self
                .history
                .iter()
                .map(|r| match r.http_status {
                    Some(status) => format!("{}:{}({})", r.attempt, r.kind, status),
                    None => format!("{}:{}", r.attempt, r.kind),
                })
                .collect::<Vec<_>>()
                .join(",");
            error = error.with_context("retry_history", trail);
        }
        error
    }
}

/// Run `operation` until it succeeds, the policy gives up, or `cancel` fires.
///
/// The operation receives the 1-based attempt number. Errors are converted
/// with `Into<ClassifiedError>`; the surfacing error carries the number of
/// attempts made.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<ClassifiedError>,
{
    let mut state = RetryState::default();

    loop {
        if cancel.is_cancelled() {
            let error = ClassifiedError::aborted("Request cancelled").with_attempts(state.attempt);
            return Err(error);
        }
        state.attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClassifiedError::aborted("Request cancelled")),
            result = operation(state.attempt) => result.map_err(Into::into),
        };

        let error = match outcome {
            Ok(value) => {
                if state.attempt > 1 {
                    debug!(attempts = state.attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !policy.should_retry(&error, state.attempt) {
            return Err(state.finish(error));
        }

        let delay = policy.next_delay(&error, state.attempt);
        state.record(&error, Some(delay));
        metrics::counter!("apiflow_retries_total", "kind" => error.kind.as_str()).increment(1);
        debug!(
            attempt = state.attempt,
            kind = %error.kind,
            delay_ms = delay.as_millis() as u64,
            "Retrying after failure"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(state.finish(ClassifiedError::aborted("Cancelled while waiting to retry")));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff(
            Duration::from_millis(10),
            2.0,
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=8)
            .map(|n| policy.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]);
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_retry_after_overrides_rate_limited() {
        let policy = RetryPolicy::default();
        let err = ClassifiedError::new(ErrorKind::RateLimited, "slow down")
            .with_retry_after(Some(Duration::from_secs(7)));
        assert_eq!(policy.next_delay(&err, 1), Duration::from_secs(7));

        let policy = policy.with_respect_retry_after(false);
        assert_eq!(policy.next_delay(&err, 1), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default().with_jitter(true);
        let err = ClassifiedError::new(ErrorKind::Network, "down");
        for _ in 0..50 {
            let d = policy.next_delay(&err, 2);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_default_predicate_uses_kind_table() {
        let policy = RetryPolicy::new(5);
        assert!(policy.should_retry(&ClassifiedError::new(ErrorKind::ServerError, "x"), 1));
        assert!(!policy.should_retry(&ClassifiedError::new(ErrorKind::Validation, "x"), 1));
        assert!(!policy.should_retry(&ClassifiedError::authentication("x"), 1));
        assert!(!policy.should_retry(&ClassifiedError::new(ErrorKind::ServerError, "x"), 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = execute_with_retry(&fast_policy(4), &CancellationToken::new(), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClassifiedError::new(ErrorKind::ServerError, "boom"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert!(err.context.contains_key("retry_history"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let result = execute_with_retry(&fast_policy(3), &CancellationToken::new(), |attempt| async move {
            if attempt < 3 {
                Err(ClassifiedError::new(ErrorKind::Network, "flaky"))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let err = execute_with_retry::<(), _, _, _>(&fast_policy(5), &CancellationToken::new(), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClassifiedError::new(ErrorKind::Authorization, "nope"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = fast_policy(5).with_predicate(|err, attempt| {
            err.kind == ErrorKind::ClientError && attempt < 2
        });

        let err = execute_with_retry::<(), _, _, _>(&policy, &CancellationToken::new(), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClassifiedError::new(ErrorKind::ClientError, "conflict"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_halts_next_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5).with_backoff(
            Duration::from_secs(10),
            1.0,
            Duration::from_secs(10),
        );

        let task = {
            let calls = calls.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                execute_with_retry::<(), _, _, _>(&policy, &cancel, |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(ClassifiedError::new(ErrorKind::Timeout, "slow"))
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
