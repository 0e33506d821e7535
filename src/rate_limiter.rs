use std::cmp::min;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket for upstream traffic, measured in bytes, refilled continuously from elapsed time
///  rather than in discrete ticks.
///
/// The bucket's capacity is one datagram (or the per-second rate if that is smaller), so a burst
///  after a quiet period is a single datagram, and the bytes sent in any window of length `T`
///  stay below `rate * T + capacity`.
///
/// NB: A datagram bigger than the capacity could never be sent if it had to be paid for in full.
///      It is charged the full capacity instead: it waits for a full bucket and then empties it.
///      The transport sizes its datagrams so that this does not happen in regular operation.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    bytes_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// starts with a full bucket
    pub fn new(bytes_per_second: u32, capacity: usize, now: Instant) -> RateLimiter {
        let bytes_per_second = f64::from(bytes_per_second);
        let capacity = (capacity as f64).min(bytes_per_second);
        RateLimiter {
            capacity,
            bytes_per_second,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.bytes_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }

    fn cost(&self, num_bytes: usize) -> f64 {
        (num_bytes as f64).min(self.capacity)
    }

    /// Takes the tokens for sending `num_bytes` if they are available, returning `false`
    ///  without taking anything otherwise.
    #[must_use]
    pub fn try_consume(&mut self, num_bytes: usize, now: Instant) -> bool {
        self.refill(now);

        let cost = self.cost(num_bytes);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        }
        else {
            false
        }
    }

    /// How long until `num_bytes` can be consumed, assuming nothing else is consumed in the meantime
    pub fn time_until_available(&mut self, num_bytes: usize, now: Instant) -> Duration {
        self.refill(now);

        let missing = self.cost(num_bytes) - self.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        // rounding up to the next millisecond avoids waking up a hair too early and spinning
        let secs = missing / self.bytes_per_second;
        min(
            Duration::from_secs_f64(secs) + Duration::from_millis(1),
            Duration::from_secs(3600),
        )
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}
