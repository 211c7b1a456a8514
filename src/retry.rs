//! Bounded retry with exponential backoff around LLM calls.
//!
//! Callers hand over a fallible async operation; failures are classified
//! into [`ErrorCategory`] and retried while the category is listed in the
//! strategy. On exhaustion the last error is surfaced with its category and
//! attempt count so the caller can pick a recovery action.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{EngineError, ErrorCategory};

/// Retry behavior knobs, taken from the session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub retryable_categories: Vec<ErrorCategory>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            retryable_categories: vec![
                ErrorCategory::RateLimit,
                ErrorCategory::Network,
                ErrorCategory::Timeout,
                ErrorCategory::Recoverable,
            ],
        }
    }
}

impl RetryStrategy {
    /// Backoff before retry `attempt` (1-indexed):
    /// `min(backoff_ms * multiplier^(attempt-1), max_backoff_ms)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn retries(&self, category: ErrorCategory) -> bool {
        self.retryable_categories.contains(&category)
    }
}

/// What the caller should do once a categorized error is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Pause,
    Skip,
    Abort,
    AskUser,
}

/// Terminal failure from the retry executor.
#[derive(Debug)]
pub struct CategorizedError {
    pub message: String,
    pub category: ErrorCategory,
    /// Total attempts made, including the first call.
    pub attempts: u32,
}

impl CategorizedError {
    /// Recovery routing: user input pauses, fatal aborts, an exhausted
    /// recoverable error is skippable, every other exhausted category aborts.
    pub fn recovery(&self) -> RecoveryAction {
        match self.category {
            ErrorCategory::UserInputRequired => RecoveryAction::Pause,
            ErrorCategory::Fatal => RecoveryAction::Abort,
            ErrorCategory::Recoverable => RecoveryAction::Skip,
            _ => RecoveryAction::Abort,
        }
    }
}

impl std::fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (category {:?}, {} attempts)",
            self.message, self.category, self.attempts
        )
    }
}

impl std::error::Error for CategorizedError {}

/// Run `op`, retrying per `strategy`. Returns the successful value together
/// with the number of attempts consumed.
pub async fn execute_with_retry<T, F, Fut>(
    mut op: F,
    strategy: &RetryStrategy,
    context: &str,
) -> Result<(T, u32), CategorizedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok((value, attempts)),
            Err(err) => {
                let category = err.category();
                let retries_left = attempts <= strategy.max_retries;
                if !strategy.retries(category) || !retries_left {
                    return Err(CategorizedError {
                        message: err.to_string(),
                        category,
                        attempts,
                    });
                }
                let delay = strategy.backoff(attempts);
                warn!(
                    context,
                    attempt = attempts,
                    category = ?category,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strategy(max_retries: u32) -> RetryStrategy {
        RetryStrategy {
            max_retries,
            backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10,
            ..RetryStrategy::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let strategy = RetryStrategy {
            max_retries: 5,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            ..RetryStrategy::default()
        };
        assert_eq!(strategy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(strategy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(strategy.backoff(3), Duration::from_millis(4_000));
        assert_eq!(strategy.backoff(10), Duration::from_millis(30_000));
        for attempt in 1..=strategy.max_retries {
            let delay = strategy.backoff(attempt).as_millis() as u64;
            assert!(delay >= strategy.backoff_ms);
            assert!(delay <= strategy.max_backoff_ms);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::llm("fetch failed"))
                    } else {
                        Ok("plan")
                    }
                }
            },
            &strategy(3),
            "test",
        )
        .await;
        let (value, attempts) = result.unwrap();
        assert_eq!(value, "plan");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> = execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::llm("403 Forbidden")) }
            },
            &strategy(3),
            "test",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Fatal);
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.recovery(), RecoveryAction::Abort);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts() {
        let result: Result<((), u32), _> = execute_with_retry(
            || async { Err(EngineError::llm("network unreachable")) },
            &strategy(2),
            "test",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Network);
        // First call plus two retries.
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn captcha_maps_to_pause() {
        let result: Result<((), u32), _> = execute_with_retry(
            || async { Err(EngineError::llm("blocked by captcha")) },
            &strategy(3),
            "test",
        )
        .await;
        assert_eq!(result.unwrap_err().recovery(), RecoveryAction::Pause);
    }

    #[tokio::test]
    async fn exhausted_recoverable_is_skippable() {
        let result: Result<((), u32), _> = execute_with_retry(
            || async { Err(EngineError::PlannerParse("bad json".to_string())) },
            &strategy(1),
            "test",
        )
        .await;
        assert_eq!(result.unwrap_err().recovery(), RecoveryAction::Skip);
    }
}
