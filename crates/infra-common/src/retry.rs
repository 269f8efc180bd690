//! Bounded retry with exponential backoff
//!
//! Every attempt runs under its own timeout, and the whole sequence is capped
//! by a total budget. Once attempts or budget run out the caller gets a
//! [`RetryOutcome::Exhausted`] and no further automatic retry happens.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry limits for one logical delivery
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
    pub total_budget: Duration,
    /// Add up to 10% random jitter to each backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(3),
            total_budget: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempts are 1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_backoff.saturating_mul(1u32 << exp);
        let capped = base.min(self.max_backoff);
        if self.jitter && !capped.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 10);
            capped + Duration::from_millis(extra)
        } else {
            capped
        }
    }
}

/// Classification of a failed attempt
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Worth trying again
    Retryable(E),
    /// Retrying cannot help (bad request, rejected payload)
    Permanent(E),
}

/// Why the last attempt failed
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Error(E),
    TimedOut,
}

/// Result of a retried operation
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    Rejected { error: E, attempts: u32 },
    Exhausted { last: AttemptFailure<E>, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Rejected { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is used up.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_policy<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
{
    let deadline = Instant::now() + policy.total_budget;
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let per_attempt = policy.attempt_timeout.min(remaining);

        let last = match tokio::time::timeout(per_attempt, op(attempt)).await {
            Ok(Ok(value)) => return RetryOutcome::Succeeded { value, attempts: attempt },
            Ok(Err(AttemptError::Permanent(error))) => {
                return RetryOutcome::Rejected { error, attempts: attempt }
            }
            Ok(Err(AttemptError::Retryable(error))) => AttemptFailure::Error(error),
            Err(_) => AttemptFailure::TimedOut,
        };

        if attempt >= max_attempts {
            return RetryOutcome::Exhausted { last, attempts: attempt };
        }

        let backoff = policy.backoff_for(attempt);
        if Instant::now() + backoff >= deadline {
            tracing::debug!(attempt, "retry budget exhausted before next attempt");
            return RetryOutcome::Exhausted { last, attempts: attempt };
        }
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            attempt_timeout: Duration::from_millis(100),
            total_budget: Duration::from_secs(5),
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = fast_policy();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = retry_with_policy(&fast_policy(), |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AttemptError::Retryable("busy"))
                } else {
                    Ok("sent")
                }
            }
        })
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_immediately() {
        let outcome: RetryOutcome<(), &str> =
            retry_with_policy(&fast_policy(), |_| async { Err(AttemptError::Permanent("bad payload")) })
                .await;
        assert!(matches!(outcome, RetryOutcome::Rejected { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_attempts() {
        let outcome: RetryOutcome<(), &str> = retry_with_policy(&fast_policy(), |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        match outcome {
            RetryOutcome::Exhausted { last: AttemptFailure::TimedOut, attempts } => {
                assert_eq!(attempts, 3)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn total_budget_caps_attempts() {
        let mut policy = fast_policy();
        policy.max_attempts = 10;
        policy.total_budget = Duration::from_millis(250);

        let outcome: RetryOutcome<(), &str> =
            retry_with_policy(&policy, |_| async { Err(AttemptError::Retryable("down")) }).await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
        assert!(outcome.attempts() < 10);
    }
}
