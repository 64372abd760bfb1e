//! Bounded polling that observes cancellation.

use super::CancellationToken;
use crate::errors::BuildError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How a bounded wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The awaited condition was observed.
    Ready(T),
    /// The wall-clock budget ran out.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
}

impl<T> WaitOutcome<T> {
    /// Returns true if the condition was observed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Returns true if the wait was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Converts a timeout into an error, keeping cancellation quiet.
    ///
    /// Returns `Ok(None)` for a cancelled wait.
    pub fn into_result(self, operation: &str, timeout: Duration) -> Result<Option<T>, BuildError> {
        match self {
            Self::Ready(value) => Ok(Some(value)),
            Self::Cancelled => Ok(None),
            Self::TimedOut => Err(BuildError::timeout(operation, timeout)),
        }
    }
}

/// Repeatedly runs `probe` until it yields a value, the timeout elapses or the
/// token is cancelled.
///
/// The probe runs once immediately, then once per `interval`. The final sleep
/// is clipped to the deadline so a timeout is reported no earlier and not much
/// later than `timeout`. Probe errors end the wait and are propagated.
pub async fn poll_until<T, F, Fut>(
    token: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<WaitOutcome<T>, BuildError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, BuildError>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        if token.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }

        attempts += 1;
        if let Some(value) = probe().await? {
            return Ok(WaitOutcome::Ready(value));
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(attempts, ?timeout, "poll deadline reached");
            return Ok(WaitOutcome::TimedOut);
        }

        let pause = interval.min(deadline - now);
        if !sleep_or_cancel(token, pause).await {
            return Ok(WaitOutcome::Cancelled);
        }
    }
}

/// Sleeps for `duration` unless the token is cancelled first.
///
/// Returns false when the sleep was cut short by cancellation.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = token.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_probe() {
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let outcome = poll_until(&token, Duration::from_secs(10), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, WaitOutcome::Ready(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline_not_before() {
        let token = CancellationToken::new();
        let start = Instant::now();

        let outcome: WaitOutcome<()> =
            poll_until(&token, Duration::from_secs(2), Duration::from_millis(300), || async {
                Ok(None)
            })
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "timed out early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2400), "timed out late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_quiet() {
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                token.cancel("operator interrupt");
            })
        };

        let outcome: WaitOutcome<()> =
            poll_until(&token, Duration::from_secs(60), Duration::from_secs(1), || async {
                Ok(None)
            })
            .await
            .unwrap();

        canceller.await.unwrap();
        assert!(outcome.is_cancelled());
        assert!(outcome.into_result("anything", Duration::from_secs(60)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_error_propagates() {
        let token = CancellationToken::new();
        let result: Result<WaitOutcome<()>, _> =
            poll_until(&token, Duration::from_secs(1), Duration::from_millis(10), || async {
                Err(BuildError::Validation("probe broke".into()))
            })
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_timed_out_into_result_is_error() {
        let err = WaitOutcome::<()>::TimedOut
            .into_result("guest shutdown", Duration::from_secs(2))
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
