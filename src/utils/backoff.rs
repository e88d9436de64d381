//! Bounded retry-with-backoff helper for waits on external services.

use rand::prelude::*;

use crate::utils::{DuplicaError, Timer};

use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Bounded, jittered, incrementally backed-off retry pacer. One instance
/// paces one logical wait (e.g., a global timestamp fetch): the caller
/// attempts its operation, and on failure awaits `wait()` before the next
/// attempt, until the overall budget runs out or the carried cancellation
/// token fires.
#[derive(Debug)]
pub struct RetryBackoff {
    /// Delay to use for the next wait, before jitter.
    next_delay: Duration,

    /// Upper bound on the per-wait delay.
    max_delay: Duration,

    /// Point in time at which the overall budget is exhausted.
    deadline: Instant,

    /// Timer driving the actual sleeps.
    timer: Timer,

    /// Cancellation token; set to true by the owner to abort all waiters.
    cancel: watch::Receiver<bool>,
}

impl RetryBackoff {
    /// Creates a retry pacer with the given initial delay, per-wait delay
    /// cap, and overall time budget.
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        budget: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self, DuplicaError> {
        if base_delay.is_zero() || budget.is_zero() {
            return Err(DuplicaError::InvalidArgument(format!(
                "zero backoff base_delay {:?} or budget {:?}",
                base_delay, budget
            )));
        }
        if max_delay < base_delay {
            return Err(DuplicaError::InvalidArgument(format!(
                "backoff max_delay {:?} < base_delay {:?}",
                max_delay, base_delay
            )));
        }

        Ok(RetryBackoff {
            next_delay: base_delay,
            max_delay,
            deadline: Instant::now() + budget,
            timer: Timer::new(),
            cancel,
        })
    }

    /// Checks the carried cancellation token.
    pub fn canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleeps until the next attempt should be made. Returns `Ok(true)` if
    /// the caller may retry, `Ok(false)` if the overall budget is exhausted,
    /// and `Err(Offline)` if the cancellation token fired while waiting.
    pub async fn wait(&mut self) -> Result<bool, DuplicaError> {
        if self.canceled() {
            return Err(DuplicaError::Offline);
        }

        let now = Instant::now();
        if now >= self.deadline {
            return Ok(false);
        }

        // jitter up to half the current delay, clipped to remaining budget
        let jitter_cap = (self.next_delay.as_millis() / 2) as u64;
        let jitter =
            Duration::from_millis(thread_rng().gen_range(0..=jitter_cap));
        let delay = (self.next_delay + jitter)
            .min(self.deadline - now)
            .max(Duration::from_millis(1));

        self.timer.restart(delay)?;
        loop {
            tokio::select! {
                _ = self.timer.timeout() => break,
                changed = self.cancel.changed() => {
                    if self.canceled() {
                        return Err(DuplicaError::Offline);
                    }
                    if changed.is_err() {
                        // sender side dropped; no cancellation can ever
                        // arrive, so just finish the sleep
                        self.timer.timeout().await;
                        break;
                    }
                }
            }
        }

        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        Ok(true)
    }
}
