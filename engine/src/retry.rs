//! Bounded retry with feedback
//!
//! A small combinator shared by supervised retrieval and the language model
//! transport. One closure performs an attempt, a second one judges its output
//! and decides whether to accept it, retry with feedback, or abort. The
//! feedback of a failed attempt is handed verbatim to the next attempt.
//!
//! The combinator never runs more than `max_attempts` attempts.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Retry immediately
    None,

    /// Fixed delay between attempts
    Fixed(Duration),

    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Retry policy: attempt bound plus backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attempt bound actually enforced (a zero bound still runs once)
    fn bound(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Context handed to each attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt<R> {
    /// 1-based attempt index
    pub index: u32,

    pub max_attempts: u32,

    /// Failure reason of the previous attempt, if any
    pub feedback: Option<R>,
}

/// Judgement on one attempt's output
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T, R> {
    /// Success, stop here
    Accept(T),

    /// Failure worth another attempt; the reason becomes the next attempt's feedback
    Retry(R),

    /// Failure that another attempt cannot fix
    Abort(R),
}

/// Final outcome of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T, R> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32, last: R },
    Aborted { attempts: u32, reason: R },
}

impl<T, R> RetryOutcome<T, R> {
    /// Number of attempts that were run
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<T, R> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last, .. } => Err(last),
            RetryOutcome::Aborted { reason, .. } => Err(reason),
        }
    }
}

/// Run `attempt` until `judge` accepts its output, aborts, or the bound is hit.
///
/// `attempt` receives the attempt index and the previous failure reason.
/// `judge` turns each output into a [`Verdict`].
pub async fn retry_with_feedback<O, T, R, F, Fut, J>(
    policy: RetryPolicy,
    mut attempt: F,
    mut judge: J,
) -> RetryOutcome<T, R>
where
    R: Clone,
    F: FnMut(Attempt<R>) -> Fut,
    Fut: Future<Output = O>,
    J: FnMut(O) -> Verdict<T, R>,
{
    let max_attempts = policy.bound();
    let mut feedback: Option<R> = None;
    let mut index = 1;

    loop {
        let output = attempt(Attempt {
            index,
            max_attempts,
            feedback: feedback.clone(),
        })
        .await;

        match judge(output) {
            Verdict::Accept(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: index,
                };
            }
            Verdict::Abort(reason) => {
                return RetryOutcome::Aborted {
                    attempts: index,
                    reason,
                };
            }
            Verdict::Retry(reason) => {
                if index >= max_attempts {
                    return RetryOutcome::Exhausted {
                        attempts: index,
                        last: reason,
                    };
                }

                let delay = policy.backoff.delay_after(index);
                debug!("Attempt {}/{} failed, retrying in {:?}", index, max_attempts, delay);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                feedback = Some(reason);
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_on_first_attempt() {
        let outcome = retry_with_feedback(
            RetryPolicy::new(3),
            |_attempt: Attempt<String>| async { 7 },
            Verdict::Accept,
        )
        .await;

        assert_eq!(outcome, RetryOutcome::Succeeded { value: 7, attempts: 1 });
    }

    #[tokio::test]
    async fn test_always_failing_stops_at_bound() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), String> = retry_with_feedback(
            RetryPolicy::new(3),
            |attempt: Attempt<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { format!("error on attempt {}", attempt.index) }
            },
            Verdict::Retry,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 3,
                last: "error on attempt 3".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_feedback_is_passed_verbatim() {
        let mut seen = Vec::new();
        let outcome = retry_with_feedback(
            RetryPolicy::new(3),
            |attempt: Attempt<String>| {
                seen.push(attempt.feedback.clone());
                async move { attempt.index }
            },
            |index| {
                if index < 3 {
                    Verdict::Retry(format!("no such column: c{}", index))
                } else {
                    Verdict::Accept(index)
                }
            },
        )
        .await;

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(
            seen,
            vec![
                None,
                Some("no such column: c1".to_string()),
                Some("no such column: c2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_stops_immediately() {
        let outcome: RetryOutcome<(), &str> = retry_with_feedback(
            RetryPolicy::new(5),
            |_attempt| async {},
            |_| Verdict::Abort("unauthorized"),
        )
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Aborted {
                attempts: 1,
                reason: "unauthorized"
            }
        );
    }

    #[tokio::test]
    async fn test_zero_bound_runs_once() {
        let outcome: RetryOutcome<(), &str> =
            retry_with_feedback(RetryPolicy::new(0), |_attempt| async {}, |_| {
                Verdict::Retry("empty")
            })
            .await;

        assert_eq!(outcome.attempts(), 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay_after(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_after(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_after(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_after(4), Duration::from_secs(5));
        assert_eq!(backoff.delay_after(40), Duration::from_secs(5));
    }
}
