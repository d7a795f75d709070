//! Conflict retry with exponential backoff.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of attempts and the delays between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { steps: 5, initial: Duration::from_millis(10), factor: 2, cap: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Defaults overridden by `CONVERGE_RETRY_STEPS` and `CONVERGE_RETRY_BASE_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let steps = std::env::var("CONVERGE_RETRY_STEPS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.steps);
        let base = std::env::var("CONVERGE_RETRY_BASE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.initial);
        Self { steps: steps.max(1), initial: base, ..d }
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut d = self.initial;
        for _ in 1..attempt {
            d = d.saturating_mul(self.factor);
            if d >= self.cap {
                return self.cap;
            }
        }
        d.min(self.cap)
    }
}

/// Source of backoff sleeps.
pub trait Clock: Send + Sync + Debug {
    fn sleep(&self, d: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, d: Duration) -> BoxFuture<'static, ()> { Box::pin(tokio::time::sleep(d)) }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or the policy runs out of attempts. The last error is returned as-is.
pub(crate) async fn on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &Arc<dyn Clock>,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() && attempt < policy.steps => e,
            Err(e) => return Err(e),
        };
        metrics::counter!("reconcile_conflict_retries_total", 1u64);
        let delay = policy.delay(attempt);
        debug!(attempt, delay = ?delay, "conflict; backing off");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { attempts: attempt, last: Box::new(err) });
            }
            _ = clock.sleep(delay) => {}
        }
        attempt += 1;
    }
}
