//! Per-source synchronization state.

use serde::{Deserialize, Serialize};

use lockstep_common::{Generation, SourceId};

/// Where a source is in the correction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Average drift within the correction threshold.
    InSync,
    /// Latest sample exceeded the threshold; not yet acted upon.
    Drifting,
    /// A smooth correction was issued and the source is settling.
    Correcting,
    /// A hard re-seek is outstanding.
    Snapping,
}

/// Sync bookkeeping for one media source.
#[derive(Debug, Clone)]
pub struct SyncState {
    /// Last reported media time (composition timeline seconds).
    pub last_media_secs: Option<f64>,

    /// Wall time of the last report.
    pub last_wall_secs: f64,

    /// When the last reported frame is expected on screen.
    pub expected_display_secs: f64,

    /// Drift of the most recent sample.
    pub last_drift_secs: f64,

    total_drift_secs: f64,
    drift_samples: u32,

    pub phase: SyncPhase,

    /// Nudges issued since the source was last in sync.
    pub consecutive_corrections: u32,

    /// Hard re-seeks issued since the source was last in sync.
    pub consecutive_snaps: u32,

    /// Latest generation issued for this source.
    pub generation: Generation,

    /// Generation of the outstanding hard re-seek, if any.
    pub pending_seek: Option<Generation>,

    /// Frames reported since init.
    pub frame_count: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            last_media_secs: None,
            last_wall_secs: 0.0,
            expected_display_secs: 0.0,
            last_drift_secs: 0.0,
            total_drift_secs: 0.0,
            drift_samples: 0,
            phase: SyncPhase::InSync,
            consecutive_corrections: 0,
            consecutive_snaps: 0,
            generation: Generation::INITIAL,
            pending_seek: None,
            frame_count: 0,
        }
    }

    /// Record the latest (media, wall) sample.
    pub fn record(&mut self, media_secs: f64, wall_secs: f64) {
        self.last_media_secs = Some(media_secs);
        self.last_wall_secs = wall_secs;
    }

    /// Fold a drift sample into the running average.
    pub fn accumulate(&mut self, drift_secs: f64) {
        self.last_drift_secs = drift_secs;
        self.total_drift_secs += drift_secs;
        self.drift_samples += 1;
    }

    pub fn drift_samples(&self) -> u32 {
        self.drift_samples
    }

    /// Average drift over the samples since the last reset, zero when empty.
    pub fn average_drift(&self) -> f64 {
        if self.drift_samples == 0 {
            0.0
        } else {
            self.total_drift_secs / self.drift_samples as f64
        }
    }

    /// Clear the drift accumulator.
    pub fn reset_accumulator(&mut self) {
        self.total_drift_secs = 0.0;
        self.drift_samples = 0;
    }

    /// Issue a new generation, superseding anything in flight.
    pub fn bump_generation(&mut self) -> Generation {
        self.generation = Generation(self.generation.0 + 1);
        self.pending_seek = None;
        self.generation
    }

    /// Back to a freshly settled state, keeping the generation and frame count.
    pub fn settle(&mut self) {
        self.reset_accumulator();
        self.phase = SyncPhase::InSync;
        self.consecutive_corrections = 0;
        self.consecutive_snaps = 0;
    }
}

/// Snapshot of one source's sync health, reported periodically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source_id: SourceId,
    pub is_master: bool,
    pub frame_count: u64,
    pub average_drift_secs: f64,
    pub last_drift_secs: f64,
    pub phase: SyncPhase,
    pub consecutive_snaps: u32,
    pub generation: Generation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_of_empty_accumulator_is_zero() {
        let state = SyncState::new();
        assert_eq!(state.average_drift(), 0.0);
        assert_eq!(state.drift_samples(), 0);
    }

    #[test]
    fn test_accumulate_and_reset() {
        let mut state = SyncState::new();
        state.accumulate(0.010);
        state.accumulate(0.030);
        assert!((state.average_drift() - 0.020).abs() < 1e-12);
        assert!((state.last_drift_secs - 0.030).abs() < 1e-12);
        state.reset_accumulator();
        assert_eq!(state.drift_samples(), 0);
    }

    #[test]
    fn test_bump_generation_clears_pending_seek() {
        let mut state = SyncState::new();
        let first = state.bump_generation();
        state.pending_seek = Some(first);
        let second = state.bump_generation();
        assert!(second > first);
        assert!(state.pending_seek.is_none());
    }
}
