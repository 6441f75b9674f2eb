//! Reconnect backoff for the publisher.
//!
//! Exponential with a capped ceiling and multiplicative jitter so that a fleet
//! of agents losing the same broker does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Jitter factor range applied to every delay.
const JITTER_MIN: f64 = 0.5;
const JITTER_MAX: f64 = 1.5;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The next reconnect delay. Doubles up to the cap, with jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.current;
        self.current = (self.current * 2).min(self.cap);

        let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        raw.mul_f64(jitter)
    }

    /// Reset to the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));

        let expected_raw = [1u64, 2, 4, 8, 8, 8];
        for raw in expected_raw {
            let delay = backoff.next_delay();
            let lower = Duration::from_secs(raw).mul_f64(JITTER_MIN);
            let upper = Duration::from_secs(raw).mul_f64(JITTER_MAX);
            assert!(
                delay >= lower && delay <= upper,
                "delay {delay:?} outside [{lower:?}, {upper:?}]"
            );
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..5 {
            backoff.next_delay();
        }

        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(1).mul_f64(JITTER_MAX));
    }

    #[test]
    fn jitter_varies_between_calls() {
        let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(4));

        // at the cap every raw delay is identical; jitter should still spread
        let delays: Vec<_> = (0..32).map(|_| backoff.next_delay()).collect();
        let all_equal = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "expected jitter to vary the delays");
    }
}
