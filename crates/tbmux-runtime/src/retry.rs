//! Exponential backoff for the upstream polling loop.

use std::time::Duration;

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Doubling retry timer: 1 s, 2 s, 4 s, ... capped at the configured maximum.
/// Owned exclusively by the polling loop; never shared.
#[derive(Debug)]
pub struct RetryBackoff {
    next_interval: Duration,
    max_interval: Duration,
}

impl RetryBackoff {
    pub fn new(max_interval: Duration) -> Self {
        Self {
            next_interval: INITIAL_RETRY_INTERVAL,
            max_interval,
        }
    }

    /// Sleeps the current interval, then doubles it up to the cap. Dropping
    /// the future cancels the sleep without consuming the interval.
    pub async fn sleep_until_retry(&mut self) {
        tokio::time::sleep(self.next_interval).await;
        self.next_interval = (self.next_interval * 2).min(self.max_interval);
    }

    /// Restores the initial interval after a successful poll.
    pub fn reset(&mut self) {
        self.next_interval = INITIAL_RETRY_INTERVAL;
    }

    pub fn next_interval(&self) -> Duration {
        self.next_interval
    }
}
