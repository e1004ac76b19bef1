//! Tick-based countdowns shared by the phase machine and the survival controller.
//!
//! A [`Countdown`] only stores the tick it started on and its length. Elapsed and
//! remaining time are derived from the tick clock on every query, so an observer that
//! rebuilds a countdown from a broadcast `(start_tick, duration_secs)` pair agrees with
//! the host on the exact expiry tick.

use serde::{Deserialize, Serialize};

use crate::util::time::{secs_to_ticks, ticks_to_secs};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Countdown {
    pub start_tick: u64,
    pub duration_secs: f32,
}

impl Countdown {
    /// Start a countdown on `now_tick`
    pub fn start(duration_secs: f32, now_tick: u64) -> Self {
        Self {
            start_tick: now_tick,
            duration_secs: duration_secs.max(0.0),
        }
    }

    /// Rebuild a countdown announced by the host. Identical to [`Countdown::start`];
    /// the local receive time is deliberately not an input.
    #[cfg(test)]
    pub fn from_broadcast(start_tick: u64, duration_secs: f32) -> Self {
        Self::start(duration_secs, start_tick)
    }

    /// First tick on which the countdown reports expiry
    pub fn expiry_tick(&self) -> u64 {
        self.start_tick + secs_to_ticks(self.duration_secs)
    }

    #[cfg(test)]
    pub fn elapsed(&self, now_tick: u64) -> f32 {
        ticks_to_secs(now_tick.saturating_sub(self.start_tick))
    }

    pub fn remaining(&self, now_tick: u64) -> f32 {
        ticks_to_secs(self.expiry_tick().saturating_sub(now_tick))
    }

    pub fn has_expired(&self, now_tick: u64) -> bool {
        now_tick >= self.expiry_tick()
    }
}
