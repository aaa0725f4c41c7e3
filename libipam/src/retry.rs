use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Bound on every read-modify-write loop against the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_backoff_base_ms() -> u64 {
    20
}

fn default_backoff_max_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Retries back to back, no sleeping.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// Exponential backoff with up to 50% jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        if self.current.is_zero() {
            return Duration::ZERO;
        }
        let base = self.current.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 2);
        let delay = Duration::from_millis(base + jitter).min(self.max);
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 300,
        };
        let mut backoff = policy.backoff();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        for _ in 0..5 {
            assert!(backoff.next_delay() <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_immediate_never_sleeps() {
        let mut backoff = RetryPolicy::immediate(3).backoff();
        for _ in 0..3 {
            assert_eq!(backoff.next_delay(), Duration::ZERO);
        }
    }
}
