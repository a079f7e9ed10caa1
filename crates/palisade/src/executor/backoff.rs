//! Capped exponential backoff for sandbox provisioning retries.

use std::time::Duration;

use crate::config::ExecutorConfig;

/// Delay calculator. Each call to [`next_delay`](Self::next_delay) returns
/// the current delay and grows the next one by `multiplier`, up to `max_delay`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    max_delay: Duration,
    multiplier: f64,
    current_delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    pub(crate) fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            config.retry_initial_delay,
            config.retry_max_delay,
            config.retry_multiplier,
        )
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = self
            .current_delay
            .mul_f64(self.multiplier)
            .min(self.max_delay);
        delay
    }

    /// Retries handed out so far.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_is_capped() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        // 4 * 2 = 8, capped at 5
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_attempts_counted() {
        let mut b = Backoff::from_config(&ExecutorConfig::default());
        assert!(!b.exceeded_max_attempts(3));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 3);
        assert!(b.exceeded_max_attempts(3));
    }
}
