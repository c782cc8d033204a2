//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for repeated attempts: `base * 2^(n-1)`, capped, plus up to 10% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 2u32.saturating_pow(self.attempt - 1);
        let capped = self.base.saturating_mul(factor).min(self.max);

        let jitter_range = capped.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(110));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(220));

        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(440));

        let fourth = backoff.next_delay();
        assert!(fourth >= Duration::from_millis(800) && fourth < Duration::from_millis(880));

        for _ in 0..8 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(1000) && delay < Duration::from_millis(1100));
        }
        assert_eq!(backoff.attempts(), 12);
    }

    #[test]
    fn zero_base_never_sleeps() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
