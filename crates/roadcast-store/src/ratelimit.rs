//! Token-bucket upload admission

use roadcast_core::time::{Clock, Timestamp};
use std::sync::Arc;

pub const DEFAULT_MAX_TOKENS: u32 = 100;
pub const DEFAULT_TOKEN_REFILLS_PER_SECOND: u32 = DEFAULT_MAX_TOKENS;

/// Token bucket refilled lazily in whole-second steps against the monotonic
/// clock. Partial seconds refill nothing. Not internally synchronized: each
/// user owns its own instance.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    max_tokens: u32,
    token_refills_per_second: u32,
    current_tokens: u32,
    last_refill_time: Timestamp,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, max_tokens: u32, token_refills_per_second: u32) -> Self {
        let last_refill_time = clock.monotonic_time_since_epoch_ms();
        Self {
            clock,
            max_tokens,
            token_refills_per_second,
            current_tokens: max_tokens,
            last_refill_time,
        }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, DEFAULT_MAX_TOKENS, DEFAULT_TOKEN_REFILLS_PER_SECOND)
    }

    /// Take one token if available.
    pub fn consume_token(&mut self) -> bool {
        self.refill_tokens();
        if self.current_tokens > 0 {
            self.current_tokens -= 1;
            return true;
        }
        false
    }

    fn refill_tokens(&mut self) {
        let now = self.clock.monotonic_time_since_epoch_ms();
        let seconds_elapsed = (now - self.last_refill_time) / 1000;
        if seconds_elapsed > 0 {
            let new_tokens = seconds_elapsed.saturating_mul(u64::from(self.token_refills_per_second));
            let refilled = u64::from(self.current_tokens).saturating_add(new_tokens);
            self.current_tokens = refilled.min(u64::from(self.max_tokens)) as u32;
            self.last_refill_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadcast_core::time::TestClock;

    #[test]
    fn test_consume_until_empty() {
        let clock = Arc::new(TestClock::new(0));
        let mut limiter = RateLimiter::new(clock, 3, 3);
        assert!(limiter.consume_token());
        assert!(limiter.consume_token());
        assert!(limiter.consume_token());
        assert!(!limiter.consume_token());
    }

    #[test]
    fn test_partial_seconds_do_not_refill() {
        let clock = Arc::new(TestClock::new(0));
        let mut limiter = RateLimiter::new(clock.clone(), 1, 1);
        assert!(limiter.consume_token());
        clock.advance_ms(999);
        assert!(!limiter.consume_token());
        clock.advance_ms(1);
        assert!(limiter.consume_token());
    }

    #[test]
    fn test_refill_saturates_at_max() {
        let clock = Arc::new(TestClock::new(0));
        let mut limiter = RateLimiter::new(clock.clone(), 2, 10);
        assert!(limiter.consume_token());
        clock.advance_ms(60_000);
        assert!(limiter.consume_token());
        assert!(limiter.consume_token());
        assert!(!limiter.consume_token());
    }

    #[test]
    fn test_polled_budget_over_whole_seconds() {
        // 10 tokens, 10/s, polled every 5 ms for 2500 ms from a full
        // bucket: exactly 10 * ceil(2500/1000) = 30 grants.
        let clock = Arc::new(TestClock::new(0));
        let mut limiter = RateLimiter::new(clock.clone(), 10, 10);
        let mut consumed = 0u64;
        let mut elapsed = 0u64;
        while elapsed < 2500 {
            if limiter.consume_token() {
                consumed += 1;
            }
            clock.advance_ms(5);
            elapsed += 5;
        }
        assert_eq!(consumed, 30);
    }
}
