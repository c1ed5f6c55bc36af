// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reconnect backoff.

use std::time::Duration;

use crate::config::SessionConfig;

/// Doubling delay between reconnect attempts, bounded by an attempt limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    min_delay: Duration,
    max_delay: Duration,
    /// Negative means unlimited.
    attempt_limit: i32,
    attempts: u32,
    next: Duration,
}

impl ReconnectPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, attempt_limit: i32) -> Self {
        let max_delay = max_delay.max(min_delay);
        Self {
            min_delay,
            max_delay,
            attempt_limit,
            attempts: 0,
            next: min_delay,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.reconnect_min_delay(),
            config.reconnect_max_delay(),
            config.reconnect_attempt_limit,
        )
    }

    /// Delay before the next attempt, or `None` once the limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt_limit >= 0 && self.attempts >= self.attempt_limit as u32 {
            return None;
        }
        self.attempts += 1;
        let delay = self.next;
        self.next = (self.next * 2).min(self.max_delay);
        Some(delay)
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next = self.min_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_limit >= 0 && self.attempts >= self.attempt_limit as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_and_caps() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(1000), Duration::from_millis(5000), -1);
        let delays: Vec<u64> = (0..5)
            .filter_map(|_| policy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
        assert!(!policy.is_exhausted());
    }

    #[test]
    fn test_attempt_limit() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 2);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.next_delay(), None);
        assert!(policy.is_exhausted());

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_zero_limit_never_retries() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 0);
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_from_config() {
        let config = SessionConfig::default().with_reconnect(500, 2000, 3);
        let mut policy = ReconnectPolicy::from_config(&config);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(policy.attempts(), 1);
    }
}
