use std::cmp::min;
use std::time::Duration;

/// Retransmission timeout per segment: it starts at a base timeout and doubles with every
///  transmission, up to a configured maximum.
#[derive(Clone, Debug)]
pub struct RetransmitBackoff {
    base_timeout: Duration,
    max_timeout: Duration,
}

impl RetransmitBackoff {
    pub fn new(base_timeout: Duration, max_timeout: Duration) -> Self {
        assert!(base_timeout <= max_timeout);
        RetransmitBackoff {
            base_timeout,
            max_timeout,
        }
    }

    /// the timeout to wait for an ACK after a segment's `attempt`th transmission (starting at 1)
    pub fn timeout_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_timeout.saturating_mul(1 << exponent);
        min(raw, self.max_timeout)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::first(1, 100)]
    #[case::zero_is_first(0, 100)]
    #[case::second(2, 200)]
    #[case::third(3, 400)]
    #[case::fourth(4, 800)]
    #[case::capped(5, 1000)]
    #[case::capped_far(40, 1000)]
    fn test_timeout_after_attempt(#[case] attempt: u32, #[case] expected_millis: u64) {
        let backoff = RetransmitBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.timeout_after_attempt(attempt), Duration::from_millis(expected_millis));
    }
}
