//! Retry and circuit breaking for bootstrap operations
//!
//! [`RetryPolicy`] wraps an operation with exponential backoff (optionally
//! jittered by ±10%) and a consecutive-failure circuit breaker. Its state is
//! process-wide: it outlives sessions and is only touched by `initialize()`.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::error::{CallError, CallResult};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Quick retries for a transport that is usually just slow to come up
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    pub fn slow() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 3.0,
            use_jitter: false,
        }
    }

    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next_delay_ms = (delay.as_millis() as f64 * self.backoff_multiplier) as u64;
        Duration::from_millis(next_delay_ms).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        let millis = delay.as_millis() as f64;
        Duration::from_millis((millis * (1.0 + jitter)) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long an open breaker refuses attempts
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Snapshot of the retry policy's shared state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicyState {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub breaker_open_until: Option<Instant>,
}

impl RetryPolicyState {
    pub fn is_open(&self, now: Instant) -> bool {
        self.breaker_open_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug)]
pub struct RetryPolicy {
    retry: RetryConfig,
    breaker: CircuitBreakerConfig,
    state: Mutex<RetryPolicyState>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default(), CircuitBreakerConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        Self {
            retry,
            breaker,
            state: Mutex::new(RetryPolicyState::default()),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn state(&self) -> RetryPolicyState {
        *self.state.lock()
    }

    /// Close the breaker and forget past failures
    pub fn reset(&self) {
        *self.state.lock() = RetryPolicyState::default();
    }

    fn check_breaker(&self, operation_name: &str) -> CallResult<()> {
        let now = Instant::now();
        let state = self.state.lock();
        match state.breaker_open_until {
            Some(until) if now < until => Err(CallError::CircuitOpen {
                operation: operation_name.to_string(),
                retry_after_ms: (until - now).as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.breaker_open_until = None;
    }

    fn record_failure(&self, operation_name: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure_at = Some(now);
        if state.consecutive_failures >= self.breaker.failure_threshold {
            state.breaker_open_until = Some(now + self.breaker.cooldown);
            warn!(
                operation = operation_name,
                failures = state.consecutive_failures,
                cooldown_ms = self.breaker.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }

    /// Run `operation` with exponential backoff behind the circuit breaker
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        let mut attempt = 0;
        let mut delay = self.retry.initial_delay;

        loop {
            self.check_breaker(operation_name)?;

            attempt += 1;
            debug!(
                operation = operation_name,
                attempt = attempt,
                max_attempts = self.retry.max_attempts,
                "Attempting operation"
            );

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt = attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    self.record_success();
                    return Ok(result);
                }
                Err(e) if e.is_recoverable() && attempt < self.retry.max_attempts => {
                    self.record_failure(operation_name);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        category = e.category(),
                        next_delay_ms = delay.as_millis() as u64,
                        "Recoverable error, will retry"
                    );

                    sleep(self.retry.jittered(delay)).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => {
                    self.record_failure(operation_name);
                    if attempt >= self.retry.max_attempts {
                        error!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed after all retry attempts"
                        );
                    } else {
                        error!(
                            operation = operation_name,
                            error = %e,
                            category = e.category(),
                            "Non-recoverable error, not retrying"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Bound `future` by `timeout`, mapping expiry to [`CallError::Timeout`]
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> CallResult<T>
where
    F: Future<Output = CallResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(CallError::Timeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_success() {
        let policy = RetryPolicy::new(RetryConfig::quick(), CircuitBreakerConfig::default());
        let mut attempts = 0;
        let result = policy
            .execute("test_operation", || {
                attempts += 1;
                let attempt = attempts;
                async move {
                    if attempt < 3 {
                        Err(CallError::signaling_failed("temporary failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts, 3);
        assert_eq!(policy.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_non_recoverable() {
        let policy = RetryPolicy::default();
        let mut attempts = 0;
        let result: CallResult<()> = policy
            .execute("test_operation", || {
                attempts += 1;
                async { Err(CallError::PermissionDenied { operation: "connect".into() }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_cools_down() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(10),
        };
        let policy = RetryPolicy::new(RetryConfig::none(), breaker);
        let fail = || async { Err::<(), _>(CallError::signaling_failed("down")) };

        assert!(matches!(policy.execute("connect", fail).await, Err(CallError::SignalingFailed { .. })));
        assert!(matches!(policy.execute("connect", fail).await, Err(CallError::SignalingFailed { .. })));
        assert!(policy.state().is_open(Instant::now()));

        let mut calls = 0;
        let refused = policy
            .execute("connect", || {
                calls += 1;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(refused, Err(CallError::CircuitOpen { .. })));
        assert_eq!(calls, 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(policy.execute("connect", || async { Ok(()) }).await, Ok(()));
        assert_eq!(policy.state(), RetryPolicyState {
            consecutive_failures: 0,
            breaker_open_until: None,
            ..policy.state()
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_expiry() {
        let result = with_timeout("slow_op", Duration::from_millis(100), async {
            sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(CallError::Timeout { operation: "slow_op".into(), duration_ms: 100 })
        );
    }
}
