//! Bounded, fixed-backoff polling.
//!
//! Every wait in the orchestrator goes through [`RetryPolicy`]: there are no
//! unbounded loops and no fixed sleeps standing in for readiness.

use crate::error::{Result, VezaError};
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Fixed number of attempts separated by a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts: attempts.max(1), delay }
    }

    /// Policy that keeps polling every `interval` for roughly `timeout`.
    pub fn within(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = (timeout.as_millis() / interval_ms) as u32 + 1;
        Self::new(attempts, interval)
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }

    /// Poll `attempt` until it yields a value or the attempts run out.
    ///
    /// `Ok(Some(_))` is success; `Ok(None)` means every attempt came back
    /// empty. If the final attempt failed, its error is returned instead,
    /// so callers can tell "never ready" from "unreachable".
    pub async fn poll<T, F, Fut>(&self, mut attempt: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut last_error: Option<VezaError> = None;

        for n in 1..=self.attempts {
            match attempt().await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {
                    last_error = None;
                    trace!(attempt = n, of = self.attempts, "not ready yet");
                }
                Err(e) => {
                    trace!(attempt = n, of = self.attempts, error = %e, "attempt failed");
                    last_error = Some(e);
                }
            }

            if n < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}
