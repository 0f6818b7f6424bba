//! Clock and timing utilities for stream synchronization.
//!
//! Every wall timestamp in Lockstep is seconds since a session epoch, taken
//! from a [`WallClock`]. Live playback uses [`SessionClock`]; tests and
//! export drive a [`ManualClock`] so timing is reproducible.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic wall time in seconds.
pub trait WallClock: Send + Sync + fmt::Debug {
    /// Seconds elapsed since this clock's epoch.
    fn now_secs(&self) -> f64;

    /// Nanoseconds elapsed since this clock's epoch.
    fn now_ns(&self) -> u64 {
        SessionClock::secs_to_ns(self.now_secs())
    }
}

/// A session clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment the session started).
#[derive(Debug, Clone)]
pub struct SessionClock {
    /// The instant the session started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl SessionClock {
    /// Create a new session clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get nanoseconds elapsed since session start.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Get seconds elapsed since session start.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at session start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Convert an elapsed nanosecond value to seconds.
    pub fn ns_to_secs(ns: u64) -> f64 {
        ns as f64 / 1_000_000_000.0
    }

    /// Convert seconds to nanoseconds. Negative values saturate to zero.
    pub fn secs_to_ns(secs: f64) -> u64 {
        (secs.max(0.0) * 1_000_000_000.0) as u64
    }
}

impl WallClock for SessionClock {
    fn now_secs(&self) -> f64 {
        self.elapsed_secs()
    }

    fn now_ns(&self) -> u64 {
        self.elapsed_ns()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time value.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_secs: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start_secs.to_bits())),
        }
    }

    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, secs: f64) {
        let now = self.now_secs();
        self.set(now + secs);
    }
}

impl WallClock for ManualClock {
    fn now_secs(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Drift measurement between a source and the position the master clock
/// says it should be at, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftMeasurement {
    /// Where the master clock expects the source to be.
    pub expected_secs: f64,
    /// Where the source reported itself.
    pub measured_secs: f64,
}

impl DriftMeasurement {
    pub fn new(expected_secs: f64, measured_secs: f64) -> Self {
        Self {
            expected_secs,
            measured_secs,
        }
    }

    /// Drift in seconds (positive = measured is ahead).
    pub fn drift_secs(&self) -> f64 {
        self.measured_secs - self.expected_secs
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_secs() * 1_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold(&self, threshold_secs: f64) -> bool {
        self.drift_secs().abs() > threshold_secs
    }
}

/// Frame rate controller for display ticks.
#[derive(Debug)]
pub struct RateController {
    target_interval_ns: u64,
    last_tick_ns: Option<u64>,
}

impl RateController {
    /// Create a controller targeting the given Hz rate.
    pub fn new(target_hz: u32) -> Self {
        Self {
            target_interval_ns: 1_000_000_000 / target_hz.max(1) as u64,
            last_tick_ns: None,
        }
    }

    /// Check if enough time has passed for the next tick.
    /// Returns true and updates internal state if ready.
    /// The first call always returns true.
    pub fn should_tick(&mut self, current_ns: u64) -> bool {
        match self.last_tick_ns {
            None => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            Some(last) if current_ns >= last + self.target_interval_ns => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            _ => false,
        }
    }

    /// Forget the last tick so the next call fires immediately.
    pub fn reset(&mut self) {
        self.last_tick_ns = None;
    }

    /// Target interval in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.target_interval_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_elapsed() {
        let clock = SessionClock::start();
        assert!(clock.elapsed_ns() < 1_000_000_000);
        assert!(!clock.epoch_wall().is_empty());
    }

    #[test]
    fn test_ns_to_secs_conversion() {
        assert!((SessionClock::ns_to_secs(1_500_000_000) - 1.5).abs() < 1e-9);
        assert_eq!(SessionClock::secs_to_ns(2.0), 2_000_000_000);
        assert_eq!(SessionClock::secs_to_ns(-1.0), 0);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(10.0);
        let other = clock.clone();
        other.advance(0.25);
        assert!((clock.now_secs() - 10.25).abs() < 1e-12);
        clock.set(3.0);
        assert_eq!(other.now_ns(), 3_000_000_000);
    }

    #[test]
    fn test_drift_measurement() {
        let drift = DriftMeasurement::new(10.100, 10.120);
        assert!((drift.drift_secs() - 0.020).abs() < 1e-9);
        assert!((drift.drift_ms() - 20.0).abs() < 1e-6);
        assert!(drift.exceeds_threshold(0.005));
        assert!(!drift.exceeds_threshold(0.150));
    }

    #[test]
    fn test_rate_controller() {
        let mut ctrl = RateController::new(60);
        assert!(ctrl.should_tick(0));
        assert!(!ctrl.should_tick(1_000_000));
        assert!(ctrl.should_tick(17_000_000));
        ctrl.reset();
        assert!(ctrl.should_tick(17_000_001));
    }
}
