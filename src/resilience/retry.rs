//! Bounded retries with backoff.
//!
//! Wraps a fallible agent attempt: consults the circuit breaker before each
//! try, classifies each failure, and sleeps a jittered backoff between
//! transient failures. Non-transient kinds surface immediately; rate limits
//! override the schedule with a long fixed delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::classifier::{classify, FailureKind, FailureReport};
use crate::agent::AgentError;
use crate::config::RetryConfig;
use crate::constants::{
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_DELAY,
    RATE_LIMIT_DELAY, RETRY_JITTER_FRACTION,
};

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffSchedule {
    #[default]
    Exponential,
    Linear,
    Fibonacci,
}

impl BackoffSchedule {
    /// Multiplier applied to the base delay after the given 1-based
    /// attempt.
    fn multiplier(self, attempt: u32) -> u32 {
        match self {
            Self::Exponential => 2u32.saturating_pow(attempt.saturating_sub(1)),
            Self::Linear => attempt,
            Self::Fibonacci => fibonacci(attempt),
        }
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub schedule: BackoffSchedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
            schedule: BackoffSchedule::default(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            schedule: BackoffSchedule::default(),
        }
    }

    /// Unjittered delay after the given 1-based attempt:
    /// `min(max_delay, base_delay · schedule(attempt))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self
            .base_delay
            .saturating_mul(self.schedule.multiplier(attempt));
        scaled.min(self.max_delay)
    }
}

/// Drives one task's attempts against the breaker and the classifier.
pub struct RetryController {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { policy, breaker }
    }

    /// Run `attempt_fn` until it succeeds, a permanent failure surfaces, or
    /// the attempt budget is spent. `on_retry` fires once per scheduled
    /// retry, before the sleep, so callers can log it in real time.
    ///
    /// Cancellation propagates out as a report without touching the
    /// breaker: an operator abort says nothing about the dependency.
    pub async fn run<T, F, Fut, R>(
        &self,
        mut attempt_fn: F,
        mut on_retry: R,
    ) -> Result<T, FailureReport>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
        R: FnMut(u32, &FailureReport, Duration),
    {
        for attempt in 1..=self.policy.max_attempts.max(1) {
            if !self.breaker.should_allow_request().await {
                warn!(
                    "Circuit breaker '{}' rejected the attempt",
                    self.breaker.key()
                );
                return Err(FailureReport::breaker_open(self.breaker.key()));
            }

            match attempt_fn(attempt).await {
                Ok(value) => {
                    self.breaker.record_success().await;
                    return Ok(value);
                }
                Err(AgentError::Cancelled) => {
                    return Err(classify(&AgentError::Cancelled));
                }
                Err(error) => {
                    let report = classify(&error);
                    self.breaker.record_failure().await;

                    let out_of_attempts = attempt >= self.policy.max_attempts;
                    if !report.transient || out_of_attempts {
                        return Err(report);
                    }

                    let delay = if report.kind == FailureKind::RateLimit {
                        RATE_LIMIT_DELAY
                    } else {
                        jittered(self.policy.delay_for(attempt))
                    };
                    debug!(
                        "Attempt {attempt} failed as {}; retrying in {delay:?}",
                        report.kind
                    );
                    on_retry(attempt, &report, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop returns from its final attempt")
    }
}

/// Apply ±20% jitter so synchronized tasks do not stampede the dependency.
fn jittered(delay: Duration) -> Duration {
    let spread = RETRY_JITTER_FRACTION;
    let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::resilience::circuit_breaker::{BreakerStore, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            schedule: BackoffSchedule::Exponential,
        }
    }

    async fn controller(dir: &TempDir, max_attempts: u32, threshold: u32) -> RetryController {
        let breaker = CircuitBreaker::load_or_default(
            "agent.invoke",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(3600),
                half_open_successes: 2,
            },
            BreakerStore::new(dir.path()),
        )
        .await
        .unwrap();
        RetryController::new(policy(max_attempts), Arc::new(breaker))
    }

    #[test]
    fn schedules_scale_as_documented() {
        assert_eq!(BackoffSchedule::Exponential.multiplier(1), 1);
        assert_eq!(BackoffSchedule::Exponential.multiplier(3), 4);
        assert_eq!(BackoffSchedule::Linear.multiplier(3), 3);
        assert_eq!(BackoffSchedule::Fibonacci.multiplier(1), 1);
        assert_eq!(BackoffSchedule::Fibonacci.multiplier(5), 5);
        assert_eq!(BackoffSchedule::Fibonacci.multiplier(6), 8);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            schedule: BackoffSchedule::Exponential,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, 3, 10).await;
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);

        let result = controller
            .run(
                |_attempt| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(AgentError::Stream {
                                message: "broken pipe".to_string(),
                            })
                        } else {
                            Ok("done".to_string())
                        }
                    }
                },
                |_, _, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_surface_immediately() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, 3, 10).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = controller
            .run(
                |_attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(AgentError::BinaryMissing {
                            searched: vec!["claude".to_string()],
                        })
                    }
                },
                |_, _, _| panic!("permanent failures must not schedule retries"),
            )
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::AgentMissing);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_bounded() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, 3, 10).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = controller
            .run(
                |_attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(AgentError::Stream {
                            message: "still broken".to_string(),
                        })
                    }
                },
                |_, _, _| {},
            )
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::AgentConnect);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_without_invoking() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, 3, 1).await;
        controller.breaker.record_failure().await;
        assert_eq!(controller.breaker.state().await, CircuitState::Open);

        let result: Result<(), _> = controller
            .run(
                |_attempt| async { panic!("the agent must not be invoked") },
                |_, _, _| {},
            )
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::BreakerOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_overrides_the_schedule() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, 2, 10).await;
        let calls = AtomicU32::new(0);
        let observed_delay = std::sync::Mutex::new(None);

        let started = tokio::time::Instant::now();
        let result = controller
            .run(
                |_attempt| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(AgentError::Exit {
                                code: Some(1),
                                stderr_tail: vec!["429 rate limit exceeded".to_string()],
                            })
                        } else {
                            Ok(())
                        }
                    }
                },
                |_, report, delay| {
                    assert_eq!(report.kind, FailureKind::RateLimit);
                    *observed_delay.lock().unwrap() = Some(delay);
                },
            )
            .await;

        result.unwrap();
        assert_eq!(
            observed_delay.lock().unwrap().unwrap(),
            RATE_LIMIT_DELAY
        );
        assert!(started.elapsed() >= RATE_LIMIT_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_does_not_count_against_the_breaker() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, 3, 1).await;

        let result: Result<(), _> = controller
            .run(|_attempt| async { Err(AgentError::Cancelled) }, |_, _, _| {})
            .await;

        assert!(result.is_err());
        assert_eq!(controller.breaker.state().await, CircuitState::Closed);
    }
}
