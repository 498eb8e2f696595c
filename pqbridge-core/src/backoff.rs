//! Bounded idle backoff for polling loops
//!
//! Both loops poll: the acquisition thread polls the device, the publisher
//! polls the mailbox. While idle they sleep for a delay that grows
//! exponentially up to a cap and snaps back as soon as work shows up, so the
//! stop flags are always observed within one `max` period.

use std::time::Duration;

/// Idle backoff configuration and state
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    /// Delay after the first idle iteration
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Multiplier applied per consecutive idle iteration
    pub multiplier: u32,
    current: Duration,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(20))
    }
}

impl IdleBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: 2,
            current: initial,
        }
    }

    /// Fixed delay, no growth
    pub fn constant(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// Delay to sleep for this idle iteration; grows the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(self.multiplier).min(self.max);
        delay
    }

    /// Work arrived: return to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Blocking sleep for the current thread
    pub fn sleep(&mut self) {
        std::thread::sleep(self.next_delay());
    }

    /// Async sleep on the tokio timer
    pub async fn sleep_async(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
