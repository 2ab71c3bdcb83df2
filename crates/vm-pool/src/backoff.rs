//! Exponential retry backoff
//!
//! Paces the optimistic-lock retry loop: the nominal delay starts at the
//! configured base and grows by 1.5x per conflict, and each draw is
//! jittered down to between half and the full nominal value so replicas
//! that collided once do not collide again in lockstep.

use std::time::Duration;

use rand::Rng;

const BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug)]
pub(crate) struct RetryBackoff {
    next: Duration,
    remaining: u32,
}

impl RetryBackoff {
    pub(crate) fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            next: base,
            remaining: max_retries,
        }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// retry budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let nominal = self.next;
        self.next = nominal.mul_f64(BACKOFF_FACTOR);

        let mut rng = rand::rng();
        Some(nominal.mul_f64(rng.random_range(0.5..=1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_the_jitter_window() {
        let base = Duration::from_millis(500);
        let mut backoff = RetryBackoff::new(base, 5);

        let mut nominal = base;
        for _ in 0..5 {
            let delay = backoff.next_delay().expect("budget not spent");
            assert!(delay >= nominal.mul_f64(0.5), "delay {delay:?} below window");
            assert!(delay <= nominal, "delay {delay:?} above window");
            nominal = nominal.mul_f64(BACKOFF_FACTOR);
        }
    }

    #[test]
    fn budget_is_enforced() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(1), 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn zero_retries_means_no_delays() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(1), 0);
        assert!(backoff.next_delay().is_none());
    }
}
