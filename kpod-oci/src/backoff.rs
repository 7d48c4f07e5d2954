//! Retry with backoff, exponential or at a fixed interval.
//!
//! `steps` is the number of attempts. The first attempt runs immediately;
//! between attempts the delay starts at `initial` and is multiplied by
//! `factor` each time, so a schedule of N steps sleeps N-1 times.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Lookup schedule for exit notification files: 500 ms, x1.2, 6 attempts.
pub const EXIT_FILE_BACKOFF: Backoff = Backoff::new(Duration::from_millis(500), 1.2, 6);

/// Period of the stop poller.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

/// The condition never held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition not met after {attempts} attempts")]
pub struct BackoffExhausted {
    pub attempts: u32,
}

impl Backoff {
    pub const fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
        }
    }

    /// Fixed-interval schedule that looks once more every `interval` until
    /// `deadline` has passed since the first attempt.
    pub fn polling(interval: Duration, deadline: Duration) -> Self {
        let ticks = deadline.as_nanos() / interval.as_nanos().max(1);
        let steps = u32::try_from(ticks).unwrap_or(u32::MAX).saturating_add(1);
        Self::new(interval, 1.0, steps)
    }

    /// Sleeps between consecutive attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut next = self.initial;
        (1..self.steps).map(move |_| {
            let current = next;
            next = next.mul_f64(self.factor);
            current
        })
    }

    /// Call `condition` until it returns true or the attempts run out.
    ///
    /// Returns the number of attempts it took.
    pub async fn retry<F, Fut>(&self, mut condition: F) -> Result<u32, BackoffExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        if self.steps == 0 {
            return Err(BackoffExhausted { attempts: 0 });
        }
        let mut attempts = 1;
        if condition().await {
            return Ok(attempts);
        }
        for delay in self.delays() {
            tokio::time::sleep(delay).await;
            attempts += 1;
            if condition().await {
                return Ok(attempts);
            }
        }
        Err(BackoffExhausted { attempts })
    }
}
