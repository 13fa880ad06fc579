//! Token bucket rate limiter (component C, first half).

/// A byte-denominated token bucket: `reserve(n)` debits `n` tokens if
/// available, otherwise zeroes the bucket and reports how long the caller
/// must wait for the refill to cover `n`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    rate_bytes_per_sec: u64,
    burst_bytes: u64,
    tokens: f64,
}

impl TokenBucket {
    /// Construct a bucket starting full, with `rate_bytes_per_sec >= 1` and
    /// `burst_bytes` as its reservoir ceiling.
    #[must_use]
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        let rate_bytes_per_sec = rate_bytes_per_sec.max(1);
        Self { rate_bytes_per_sec, burst_bytes, tokens: burst_bytes as f64 }
    }

    /// Construct a bucket whose burst equals its rate (the default per
    /// §4.C when no explicit burst is configured).
    #[must_use]
    pub fn with_rate(rate_bytes_per_sec: u64) -> Self {
        Self::new(rate_bytes_per_sec, rate_bytes_per_sec)
    }

    /// Current refill rate in bytes/sec.
    #[must_use]
    pub fn rate_bytes_per_sec(&self) -> u64 {
        self.rate_bytes_per_sec
    }

    /// Replace the refill rate (used by `force_rate_bytes_per_sec`
    /// overrides), leaving the current token count untouched.
    pub fn set_rate_bytes_per_sec(&mut self, rate: u64) {
        self.rate_bytes_per_sec = rate.max(1);
    }

    /// Refill by `elapsed * rate`, capped at `burst_bytes`, then attempt to
    /// debit `n` tokens.
    ///
    /// Returns `0` if `n` tokens were available and debited. Otherwise
    /// zeroes the bucket and returns `ceil((n - tokens) * 1000 / rate)`
    /// milliseconds the caller should wait before retrying.
    #[must_use]
    pub fn reserve(&mut self, n: u64, elapsed: std::time::Duration) -> u64 {
        self.refill(elapsed);

        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            return 0;
        }

        let deficit = n - self.tokens;
        self.tokens = 0.0;
        let wait_ms = (deficit * 1000.0 / self.rate_bytes_per_sec as f64).ceil();
        wait_ms as u64
    }

    fn refill(&mut self, elapsed: std::time::Duration) {
        let added = elapsed.as_secs_f64() * self.rate_bytes_per_sec as f64;
        self.tokens = (self.tokens + added).min(self.burst_bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn full_bucket_allows_burst_with_no_wait() {
        let mut bucket = TokenBucket::new(1024, 1024);
        assert_eq!(bucket.reserve(1024, Duration::ZERO), 0);
    }

    #[test]
    fn exceeding_burst_on_full_bucket_returns_nonzero_wait() {
        let mut bucket = TokenBucket::new(1024, 1024);
        let wait = bucket.reserve(1025, Duration::ZERO);
        assert!(wait >= 1000 / 1024);
    }

    #[test]
    fn refill_respects_elapsed_time() {
        let mut bucket = TokenBucket::new(1000, 1000);
        assert_eq!(bucket.reserve(1000, Duration::ZERO), 0);
        // Bucket empty; after 0.5s, 500 bytes should have refilled.
        assert_eq!(bucket.reserve(500, Duration::from_millis(500)), 0);
    }

    #[test]
    fn refill_never_exceeds_burst_ceiling() {
        let mut bucket = TokenBucket::new(1000, 500);
        // Huge elapsed time should still cap at burst_bytes.
        assert_eq!(bucket.reserve(500, Duration::from_secs(100)), 0);
        assert_ne!(bucket.reserve(1, Duration::ZERO), 0);
    }

    #[test]
    fn rate_limit_delays_second_frame_by_about_one_second() {
        let mut bucket = TokenBucket::new(1024, 1024);
        let first = bucket.reserve(1028, Duration::ZERO);
        assert!(first <= 10, "expected a negligible wait on the first frame, got {first}");
        let wait = bucket.reserve(1028, Duration::ZERO);
        assert!((900..=1100).contains(&wait), "expected ~1000ms wait, got {wait}");
    }

    proptest! {
        #[test]
        fn reserve_never_panics(rate in 1u64..1_000_000, burst in 0u64..1_000_000, n in 0u64..2_000_000) {
            let mut bucket = TokenBucket::new(rate, burst);
            let _ = bucket.reserve(n, Duration::from_millis(10));
        }
    }
}
