use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Token-bucket admission control for the inbound packet path.
///
/// `per_second(0)` disables the bucket entirely, which keeps the unlimited
/// default out of the hot path's branch predictor worries.
#[derive(Debug)]
pub struct IngressPace {
    limiter: Option<DefaultDirectRateLimiter>,
}

impl IngressPace {
    pub fn per_second(pps: u32) -> Self {
        let limiter =
            NonZeroU32::new(pps).map(|pps| RateLimiter::direct(Quota::per_second(pps)));
        Self { limiter }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    /// Whether one more packet may be accepted right now.
    #[inline]
    pub fn admit(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }
}
