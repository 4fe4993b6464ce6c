//! Bounded polling for cloud state changes.
//!
//! Every state change (create, attach, detach, start, stop) is followed by a
//! busy-wait at a fixed interval. The wait has no cancellation path: it either
//! observes the wanted state or gives up after `max_attempts` polls.

use crate::error::{ShrinkError, ShrinkResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Source of delays, swapped out in tests so timeouts do not take real time.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Poll `probe` until it yields a value.
///
/// `probe` returns `Ok(None)` while the resource has not reached the wanted
/// state yet. Errors from `probe` abort the wait immediately.
pub async fn poll_until<T, F, Fut>(
    clock: &dyn Clock,
    policy: RetryPolicy,
    operation: &'static str,
    resource: &str,
    mut probe: F,
) -> ShrinkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ShrinkResult<Option<T>>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        if attempt < attempts {
            clock.sleep(policy.interval()).await;
        }
    }

    Err(ShrinkError::TimedOut {
        operation,
        resource: resource.to_string(),
        attempts,
    })
}
