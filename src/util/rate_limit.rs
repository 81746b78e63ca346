//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Minimum interval between paddle input submissions, capped at the tick rate.
/// Inputs arriving faster than this are dropped, never queued.
pub const INPUT_MIN_INTERVAL_MS: u64 = 16;

/// General WebSocket message rate limit (chat, pings, control messages)
pub const WS_MESSAGE_RATE_LIMIT: u32 = 120; // Max 120 messages per second

/// Create a limiter that admits one cell per `interval_ms`, no burst
pub fn create_interval_limiter(interval_ms: u64) -> Arc<Limiter> {
    let quota = Quota::with_period(Duration::from_millis(interval_ms))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(quota))
}

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct PlayerRateLimiter {
    input_limiter: Arc<Limiter>,
    message_limiter: Arc<Limiter>,
}

impl PlayerRateLimiter {
    pub fn new() -> Self {
        Self {
            input_limiter: create_interval_limiter(INPUT_MIN_INTERVAL_MS),
            message_limiter: create_limiter(WS_MESSAGE_RATE_LIMIT),
        }
    }

    /// Check if a paddle input is allowed (returns true if allowed)
    pub fn check_input(&self) -> bool {
        self.input_limiter.check().is_ok()
    }

    /// Check if a generic message is allowed
    pub fn check_message(&self) -> bool {
        self.message_limiter.check().is_ok()
    }
}

impl Default for PlayerRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
