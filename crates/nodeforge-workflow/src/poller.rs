//! Bounded, cancellable readiness polling

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a wait ended without the condition holding
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("condition not met within {0:?}")]
    Timeout(Duration),

    #[error("wait cancelled")]
    Cancelled,
}

/// Linear poller: checks a predicate every `interval` until `timeout`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    timeout: Duration,
    interval: Duration,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll until `predicate` returns true, the timeout elapses or `cancel`
    /// fires, whichever comes first
    pub async fn wait<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut predicate: F,
    ) -> Result<(), PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }

            attempt += 1;
            let ready = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = sleep_until(deadline) => return Err(PollError::Timeout(self.timeout)),
                ready = predicate() => ready,
            };
            if ready {
                return Ok(());
            }
            trace!(attempt, "Condition not met yet");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = sleep_until(deadline) => return Err(PollError::Timeout(self.timeout)),
                _ = sleep(self.interval) => {}
            }
        }
    }
}

/// Convenience wrapper around [`Poller::wait`]
pub async fn wait_for<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    predicate: F,
) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    Poller::new(timeout, interval).wait(cancel, predicate).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_polls() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let result = wait_for(
            &CancellationToken::new(),
            Duration::from_secs(60),
            Duration::from_secs(2),
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let started = Instant::now();
        let result = wait_for(
            &CancellationToken::new(),
            Duration::from_secs(10),
            Duration::from_secs(3),
            || async { false },
        )
        .await;

        assert_eq!(result, Err(PollError::Timeout(Duration::from_secs(10))));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = wait_for(
            &cancel,
            Duration::from_secs(300),
            Duration::from_secs(1),
            || async { false },
        )
        .await;
        assert_eq!(result, Err(PollError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_poll() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Poller::new(Duration::from_secs(1), Duration::from_millis(10))
            .wait(&cancel, || async { true })
            .await;
        assert_eq!(result, Err(PollError::Cancelled));
    }
}
