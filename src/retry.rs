//! Bounded exponential backoff shared by the persistence retry loop and the
//! client reconnection state machine.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a delay cap and an attempt ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Number of retries allowed after the initial failure
    pub max_retries: u32,
    /// Randomize each delay into `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retries: 4,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_retries,
            jitter: false,
        }
    }

    /// Policy matching the browser client: 1s doubling, five tries, 30s cap.
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before retry number `retry` (1-based).
    ///
    /// Returns `None` once the ceiling is reached.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }

        let factor = 2u32.saturating_pow(retry - 1);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
            Some(Duration::from_millis(jittered))
        } else {
            Some(delay)
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(350), 5);

        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_ceiling() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1), 2);

        assert!(policy.delay_for(0).is_none());
        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(Duration::from_millis(400), Duration::from_secs(1), 3)
            .with_jitter(true);

        for _ in 0..50 {
            let delay = policy.delay_for(1).unwrap();
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_huge_retry_does_not_overflow() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX);
        assert_eq!(policy.delay_for(200), Some(Duration::from_secs(30)));
    }
}
