//! Exponential backoff between reconnect attempts.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With the defaults (initial=1s, multiplier=1.5, max=60s) the kernel waits
//! 1s, 1.5s, 2.25s, ... and settles at one attempt per minute. A bridge is
//! expected to outlive broker restarts, so the default limit is
//! [`AttemptLimit::Unlimited`]; a fixed limit turns a long outage into a
//! [`BackoffError`] that shuts the bridge down.

use std::time::Duration;

use thiserror::Error;

/// Error returned once the attempt limit is exceeded.
#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// How many consecutive failed attempts are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLimit {
    /// Retry forever, at `max_delay` once the delay saturates.
    Unlimited,
    /// Give up after this many attempts.
    Fixed(u32),
    /// Give up once the delay would exceed `max_delay`.
    UntilSaturated,
}

impl AttemptLimit {
    /// Maps the configuration convention (`0` = unlimited) onto a limit.
    pub fn from_config(max_attempts: u32) -> Self {
        match max_attempts {
            0 => AttemptLimit::Unlimited,
            n => AttemptLimit::Fixed(n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    limit: AttemptLimit,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier,
            attempt: 0,
            limit: AttemptLimit::Unlimited,
        }
    }

    pub fn with_limit(mut self, limit: AttemptLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Number of attempts before the delay reaches `max_delay`.
    pub fn saturation_attempts(&self) -> u32 {
        if self.initial_delay >= self.max_delay || self.multiplier <= 1.0 {
            return 1;
        }

        // initial * multiplier^n = max  =>  n = log(max/initial) / log(multiplier)
        let ratio = self.max_delay.as_secs_f64() / self.initial_delay.as_secs_f64();
        ratio.log(self.multiplier).floor() as u32 + 1
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt += 1;

        let max_attempts = match self.limit {
            AttemptLimit::Unlimited => None,
            AttemptLimit::Fixed(n) => Some(n),
            AttemptLimit::UntilSaturated => Some(self.saturation_attempts()),
        };
        if let Some(max) = max_attempts {
            if self.attempt > max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        Ok(sleep)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut backoff = Backoff::default();

        let first = backoff.next_sleep().unwrap();
        assert_eq!(first, Duration::from_secs(1));

        let second = backoff.next_sleep().unwrap();
        assert_eq!(second, Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);

        let delays: Vec<_> = (0..8).map(|_| backoff.next_sleep().unwrap()).collect();
        assert_eq!(delays[4], Duration::from_secs(10));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[test]
    fn test_unlimited_never_gives_up() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(4), 2.0);
        for _ in 0..1_000 {
            assert!(backoff.next_sleep().is_ok());
        }
    }

    #[test]
    fn test_fixed_limit() {
        let mut backoff = Backoff::default().with_limit(AttemptLimit::Fixed(2));

        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());
        match backoff.next_sleep() {
            Err(BackoffError::MaxAttemptLimitError(max)) => assert_eq!(max, 2),
            other => panic!("expected limit error, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_restarts_progression() {
        let mut backoff = Backoff::default();
        backoff.next_sleep().unwrap();
        backoff.next_sleep().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_saturation_attempts() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        assert_eq!(backoff.saturation_attempts(), 4);

        let flat = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.9);
        assert_eq!(flat.saturation_attempts(), 1);
    }

    #[test]
    fn test_limit_from_config() {
        assert_eq!(AttemptLimit::from_config(0), AttemptLimit::Unlimited);
        assert_eq!(AttemptLimit::from_config(7), AttemptLimit::Fixed(7));
    }
}
