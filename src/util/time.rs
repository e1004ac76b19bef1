//! Time utilities for the match simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Tick rate configuration
pub const SIMULATION_TPS: u32 = 30; // 30 ticks per second
pub const SNAPSHOT_TPS: u32 = 5; // 5 lifecycle snapshots per second
pub const TICK_DURATION_MICROS: u64 = 1_000_000 / SIMULATION_TPS as u64;

/// Seconds covered by a span of ticks
pub fn ticks_to_secs(ticks: u64) -> f32 {
    ticks as f32 / SIMULATION_TPS as f32
}

/// Whole ticks needed to cover `secs`, rounded up
pub fn secs_to_ticks(secs: f32) -> u64 {
    (secs.max(0.0) * SIMULATION_TPS as f32).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions_agree() {
        assert_eq!(secs_to_ticks(1.0), SIMULATION_TPS as u64);
        assert_eq!(secs_to_ticks(0.0), 0);
        assert_eq!(secs_to_ticks(-3.0), 0);
        assert!((ticks_to_secs(SIMULATION_TPS as u64 * 3) - 3.0).abs() < f32::EPSILON);
    }
}
