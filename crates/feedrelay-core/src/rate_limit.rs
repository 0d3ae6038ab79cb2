//! Foreground request rate limiting.
//!
//! The adapter spends one credit per inbound request against a shared
//! budget. When the budget is exhausted the request is refused with a
//! retry hint rather than queued.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Credit-based limiter over a per-minute budget.
#[derive(Clone)]
pub struct CreditLimiter {
    limiter: Arc<DirectRateLimiter>,
    clock: DefaultClock,
}

impl CreditLimiter {
    /// Budget of `credits_per_minute` requests, spendable in bursts up to
    /// the full budget.
    pub fn per_minute(credits_per_minute: u32) -> Self {
        let safe_limit = credits_per_minute.max(1);
        let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

        let seconds_per_credit = (60.0 / f64::from(safe_limit)).max(0.001);
        let quota = Quota::with_period(Duration::from_secs_f64(seconds_per_credit))
            .expect("period is always greater than zero")
            .allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            clock: DefaultClock::default(),
        }
    }

    /// Spend one credit. On an exhausted budget, returns the wait until a
    /// credit frees up.
    pub fn try_spend(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_burst_up_to_capacity() {
        let limiter = CreditLimiter::per_minute(3);

        assert!(limiter.try_spend().is_ok());
        assert!(limiter.try_spend().is_ok());
        assert!(limiter.try_spend().is_ok());

        let wait = limiter.try_spend().expect_err("budget must be exhausted");
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn zero_budget_is_clamped_to_one() {
        let limiter = CreditLimiter::per_minute(0);
        assert!(limiter.try_spend().is_ok());
        assert!(limiter.try_spend().is_err());
    }
}
