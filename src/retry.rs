//! Deadline-bounded retry loop shared by every polling call site.
//!
//! An operation is attempted immediately and then every `poll_interval`
//! until it succeeds, fails fatally, the overall timeout elapses, or the
//! cancellation token fires. The overall deadline races the whole loop, so
//! an attempt that never resolves cannot hold the caller past it.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Timing parameters for [`retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound on the whole loop.
    pub timeout: Duration,
    /// Pause between a failed attempt and the next one.
    pub poll_interval: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Failure of a single attempt.
#[derive(Debug)]
pub enum Retry<E> {
    /// Worth trying again after the poll interval.
    Transient(E),
    /// Ends the loop immediately.
    Fatal(E),
}

/// Reasons [`retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The cancellation token fired.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts started before cancellation.
        attempts: u32,
    },
    /// The overall timeout elapsed.
    #[error("timed out after {attempts} attempt(s){}", describe_last(.last.as_ref()))]
    Timeout {
        /// Attempts started before the deadline.
        attempts: u32,
        /// Most recent transient failure, if any attempt completed.
        last: Option<E>,
    },
    /// An attempt failed fatally.
    #[error("aborted after {attempts} attempt(s): {source}")]
    Aborted {
        /// Attempts made, including the fatal one.
        attempts: u32,
        /// The fatal failure.
        #[source]
        source: E,
    },
}

fn describe_last<E: std::fmt::Display>(last: Option<&E>) -> String {
    last.map_or_else(String::new, |err| format!(": {err}"))
}

/// Retries `op` according to `policy` until it succeeds.
///
/// `op` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`RetryError::Cancelled`] when `cancel` fires,
/// [`RetryError::Timeout`] when the policy's timeout elapses, and
/// [`RetryError::Aborted`] when an attempt reports [`Retry::Fatal`].
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Retry<E>>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0_u32;
    let mut last = None;

    let looped = async {
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }
            attempts += 1;

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                outcome = op(attempts) => outcome,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(Retry::Fatal(source)) => return Err(RetryError::Aborted { attempts, source }),
                Err(Retry::Transient(err)) => {
                    debug!(attempt = attempts, error = %err, "attempt failed; retrying");
                    last = Some(err);
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                () = sleep(policy.poll_interval) => {}
            }
        }
    };

    let result = timeout_at(deadline, looped).await;
    result.unwrap_or(Err(RetryError::Timeout { attempts, last }))
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn assert_elapsed(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected about {expected:?}"
        );
    }

    fn policy(timeout_secs: u64) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(timeout_secs), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let started = Instant::now();
        let result = retry(policy(60), &CancellationToken::new(), |attempt| async move {
            if attempt < 3 {
                Err(Retry::Transient(io::Error::other("not yet")))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert!(matches!(result, Ok(3)), "unexpected result: {result:?}");
        assert_elapsed(started, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_stops_immediately() {
        let result: Result<(), _> = retry(policy(60), &CancellationToken::new(), |_| async {
            Err(Retry::Fatal(io::Error::other("denied")))
        })
        .await;

        assert!(
            matches!(result, Err(RetryError::Aborted { attempts: 1, .. })),
            "unexpected result: {result:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_a_hanging_attempt() {
        let started = Instant::now();
        let result: Result<(), RetryError<io::Error>> =
            retry(policy(5), &CancellationToken::new(), |_| {
                std::future::pending::<Result<(), Retry<io::Error>>>()
            })
            .await;

        assert!(
            matches!(result, Err(RetryError::Timeout { attempts: 1, last: None })),
            "unexpected result: {result:?}"
        );
        assert_elapsed(started, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_last_error() {
        let result: Result<(), _> = retry(policy(3), &CancellationToken::new(), |_| async {
            Err(Retry::Transient(io::Error::other("refused")))
        })
        .await;

        let Err(RetryError::Timeout { last: Some(err), .. }) = &result else {
            panic!("expected timeout with last error, got {result:?}");
        };
        assert_eq!(err.to_string(), "refused");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_poll_sleep() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = retry(policy(60), &token, |_| async {
            Err(Retry::Transient(io::Error::other("refused")))
        })
        .await;

        assert!(
            matches!(result, Err(RetryError::Cancelled { attempts: 2 })),
            "unexpected result: {result:?}"
        );
        assert_elapsed(started, Duration::from_millis(1500));
    }
}
