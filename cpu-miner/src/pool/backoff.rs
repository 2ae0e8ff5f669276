//! Reconnect backoff.

use std::time::Duration;

/// Weight of a credential rejection relative to a transport failure.
pub const CREDENTIAL_FAILURE_WEIGHT: u32 = 2;

/// Exponential reconnect delay.
///
/// The delay is `min * 2^(failures - 1)`, capped at `max`. Reaching Ready
/// resets the failure count.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            failures: 0,
        }
    }

    /// Consecutive (weighted) failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn record_failure(&mut self, weight: u32) -> Duration {
        self.failures = self.failures.saturating_add(weight.max(1));
        self.delay()
    }

    /// Delay implied by the current failure count.
    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let shift = (self.failures - 1).min(31);
        self.min.saturating_mul(1u32 << shift).min(self.max)
    }

    /// The delay ceiling.
    pub fn ceiling(&self) -> Duration {
        self.max
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_holds() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<_> = (0..7).map(|_| backoff.record_failure(1)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10, 10, 10].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn delays_never_decrease() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(60));
        let mut last = Duration::ZERO;
        for _ in 0..100 {
            let delay = backoff.record_failure(1);
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(60));
            last = delay;
        }
    }

    #[test]
    fn credential_failures_escalate_faster() {
        let mut plain = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut cred = plain.clone();
        plain.record_failure(1);
        cred.record_failure(CREDENTIAL_FAILURE_WEIGHT);
        assert!(cred.delay() > plain.delay());
        assert_eq!(cred.failures(), 2);
    }

    #[test]
    fn reset_clears_failures() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.record_failure(1);
        backoff.record_failure(1);
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert_eq!(backoff.record_failure(1), Duration::from_secs(1));
    }
}
