//! Per-consumer token-bucket rate limiter (§5 "consumerMessageRateLimit").

use std::time::Instant;

pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(tokens_per_second: f64, burst_size: u32) -> Self {
        Self {
            tokens: burst_size as f64,
            capacity: burst_size as f64,
            refill_per_sec: tokens_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempt to consume one token. Returns `false` if the bucket is
    /// empty, in which case the caller should emit `ConsumerRateLimited`
    /// and drop the message rather than queue it.
    pub fn try_consume(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_up_to_capacity_immediately() {
        let mut bucket = TokenBucket::new(1.0, 3);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn refill_is_bounded_by_capacity() {
        let mut bucket = TokenBucket::new(1000.0, 2);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        // Capacity is 2 regardless of how much time passed.
        assert!(!bucket.try_consume());
    }
}
