//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Participant messages (positions, spawn requests, loadout changes)
pub const PARTICIPANT_RATE_LIMIT: u32 = 40;

/// Engine shim reports arrive in bursts when a wave is wiped
pub const ENGINE_RATE_LIMIT: u32 = 500;

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    input_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn for_participant() -> Self {
        Self {
            input_limiter: create_limiter(PARTICIPANT_RATE_LIMIT),
        }
    }

    pub fn for_engine() -> Self {
        Self {
            input_limiter: create_limiter(ENGINE_RATE_LIMIT),
        }
    }

    /// Check if an input message is allowed (returns true if allowed)
    pub fn check_input(&self) -> bool {
        self.input_limiter.check().is_ok()
    }
}
