//! Bounded, cancellable polling.
//!
//! A wait runs its check immediately, then once per interval until the check
//! reports [`Check::Done`], the timeout elapses, or the token is cancelled.
//! Both the sleep and the check itself race the cancellation token and the
//! deadline, so an abort or a timeout surfaces promptly even while a slow
//! observation is in flight.

use crate::config::PollConfig;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Result of one poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    /// Observed state matches
    Done(T),
    /// Not yet converged; carries the observed mismatch
    Pending(String),
}

/// Successful termination of a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled<T> {
    pub value: T,
    pub attempts: u32,
    /// Mismatch reported by the last unsuccessful attempt, if any
    pub last_mismatch: Option<String>,
}

/// Unsuccessful termination of a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    TimedOut {
        last_mismatch: Option<String>,
        attempts: u32,
    },
    Cancelled {
        last_mismatch: Option<String>,
        attempts: u32,
    },
}

impl PollError {
    pub fn last_mismatch(&self) -> Option<&str> {
        match self {
            PollError::TimedOut { last_mismatch, .. } | PollError::Cancelled { last_mismatch, .. } => {
                last_mismatch.as_deref()
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollError::TimedOut { attempts, .. } | PollError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Poll `check` until it is done, the timeout elapses, or `token` is cancelled
pub async fn poll_until<T, F, Fut>(
    config: &PollConfig,
    token: &CancellationToken,
    mut check: F,
) -> std::result::Result<Polled<T>, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check<T>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0u32;
    let mut last_mismatch: Option<String> = None;

    loop {
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(PollError::Cancelled { last_mismatch, attempts });
            }
            outcome = check() => outcome,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(PollError::TimedOut { last_mismatch, attempts });
            }
        };

        match outcome {
            Check::Done(value) => {
                return Ok(Polled {
                    value,
                    attempts,
                    last_mismatch,
                })
            }
            Check::Pending(mismatch) => {
                trace!(attempt = attempts, %mismatch, "Not yet converged");
                last_mismatch = Some(mismatch);
            }
        }

        let next = Instant::now() + config.interval;
        if next > deadline {
            return Err(PollError::TimedOut {
                last_mismatch,
                attempts,
            });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(PollError::Cancelled { last_mismatch, attempts });
            }
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(interval: u64, timeout: u64) -> PollConfig {
        PollConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_on_first_attempt_without_waiting() {
        let start = Instant::now();
        let token = CancellationToken::new();

        let polled = poll_until(&config(5, 120), &token, || async { Check::Done(7) })
            .await
            .unwrap();

        assert_eq!(polled.value, 7);
        assert_eq!(polled.attempts, 1);
        assert!(polled.last_mismatch.is_none());
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_pending_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let polled = poll_until(&config(5, 120), &token, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Check::Pending(format!("got {} backend groups, want 4", n))
                } else {
                    Check::Done(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(polled.value, 4);
        assert_eq!(polled.attempts, 4);
        assert_eq!(
            polled.last_mismatch.as_deref(),
            Some("got 3 backend groups, want 4")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_last_mismatch() {
        let start = Instant::now();
        let token = CancellationToken::new();

        let err = poll_until(&config(5, 20), &token, || async {
            Check::<()>::Pending("still missing".to_string())
        })
        .await
        .unwrap_err();

        // Attempts at t=0, 5, 10, 15, 20
        assert_eq!(
            err,
            PollError::TimedOut {
                last_mismatch: Some("still missing".to_string()),
                attempts: 5,
            }
        );
        assert_eq!(Instant::now() - start, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_is_not_timeout() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            child.cancel();
        });

        let start = Instant::now();
        let err = poll_until(&config(5, 120), &token, || async {
            Check::<()>::Pending("waiting".to_string())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Cancelled { attempts: 3, .. }));
        assert_eq!(err.last_mismatch(), Some("waiting"));
        assert!(Instant::now() - start < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_slow_check() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            child.cancel();
        });

        let err = poll_until(&config(5, 120), &token, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Check::Done(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 1);
        assert!(matches!(err, PollError::Cancelled { last_mismatch: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_slow_check() {
        let start = Instant::now();
        let token = CancellationToken::new();

        let err = poll_until(&config(5, 120), &token, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Check::Done(())
        })
        .await
        .unwrap_err();

        assert_eq!(
            err,
            PollError::TimedOut {
                last_mismatch: None,
                attempts: 1,
            }
        );
        assert_eq!(Instant::now() - start, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_mismatch_from_earlier_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();
        let start = Instant::now();

        let err = poll_until(&config(5, 30), &token, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Check::Pending("zone-b missing".to_string());
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Check::Done(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 2);
        assert!(matches!(err, PollError::TimedOut { .. }));
        assert_eq!(err.last_mismatch(), Some("zone-b missing"));
        assert_eq!(Instant::now() - start, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let err = poll_until(&config(5, 120), &token, || async { Check::Done(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Cancelled { .. }));
    }
}
