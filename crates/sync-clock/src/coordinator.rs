//! Drift coordinator state machine.
//!
//! All positions are composition-timeline seconds: callers add a layer's
//! source offset before reporting a sample and subtract it again when
//! applying a hard re-seek target. Wall times come from one shared
//! [`lockstep_common::WallClock`].

use std::collections::BTreeMap;

use lockstep_common::{DriftMeasurement, Generation, SourceId, SyncConfig};

use crate::state::{SourceStats, SyncPhase, SyncState};

/// One frame report from a media source.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSample {
    pub source_id: SourceId,
    /// Reported media position, on the composition timeline.
    pub media_secs: f64,
    /// Wall time the frame was observed.
    pub wall_secs: f64,
    /// Wall time the frame is expected to be displayed.
    pub expected_display_secs: f64,
}

/// Correction to apply to a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncAction {
    /// Shift the source's presentation time back by `adjustment_secs`
    /// (negative moves it forward). No seek, no completion expected.
    Nudge { adjustment_secs: f64 },
    /// Re-seek the source to `target_secs` and report back with
    /// [`DriftCoordinator::seek_completed`].
    HardSeek { target_secs: f64 },
}

/// A correction addressed to one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncDirective {
    pub source_id: SourceId,
    pub generation: Generation,
    pub action: SyncAction,
}

/// Output of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Directive(SyncDirective),
    /// Hard re-seeks keep failing; reported, never fatal.
    DriftUnrecoverable {
        source_id: SourceId,
        drift_secs: f64,
        snaps: u32,
    },
    Stats(Vec<SourceStats>),
    Error { message: String },
}

/// Master clock and per-source drift tracking.
#[derive(Debug)]
pub struct DriftCoordinator {
    config: SyncConfig,
    sources: BTreeMap<SourceId, SyncState>,
    master: Option<SourceId>,
    playing: bool,
}

impl DriftCoordinator {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            sources: BTreeMap::new(),
            master: None,
            playing: false,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn master(&self) -> Option<&SourceId> {
        self.master.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn state(&self, source_id: &SourceId) -> Option<&SyncState> {
        self.sources.get(source_id)
    }

    /// Start tracking a source. Re-initializing resets its state.
    pub fn init(&mut self, source_id: SourceId) {
        tracing::debug!(source = %source_id, "Tracking source");
        let mut state = SyncState::new();
        if let Some(previous) = self.sources.get(&source_id) {
            state.generation = previous.generation;
            state.bump_generation();
        }
        self.sources.insert(source_id, state);
    }

    /// Stop tracking a source.
    pub fn remove(&mut self, source_id: &SourceId) {
        if self.sources.remove(source_id).is_some() {
            tracing::debug!(source = %source_id, "Stopped tracking source");
        }
        if self.master.as_ref() == Some(source_id) {
            self.master = None;
        }
    }

    /// Make `source_id` the master clock.
    pub fn set_master(&mut self, source_id: SourceId) -> Vec<SyncEvent> {
        if !self.sources.contains_key(&source_id) {
            return vec![unknown_source(&source_id)];
        }
        tracing::info!(source = %source_id, "Master source set");
        self.master = Some(source_id);
        for state in self.sources.values_mut() {
            state.settle();
        }
        Vec::new()
    }

    pub fn clear_master(&mut self) {
        self.master = None;
    }

    /// Where the master clock says the timeline is at `wall_secs`.
    pub fn master_position(&self, wall_secs: f64) -> Option<f64> {
        let master = self.sources.get(self.master.as_ref()?)?;
        let media = master.last_media_secs?;
        if self.playing {
            Some(media + (wall_secs - master.last_wall_secs))
        } else {
            Some(media)
        }
    }

    /// Event path: record a frame report and snap immediately on large drift.
    pub fn on_frame(&mut self, sample: FrameSample) -> Vec<SyncEvent> {
        let is_master = self.master.as_ref() == Some(&sample.source_id);
        let expected = if is_master {
            None
        } else {
            self.master_position(sample.wall_secs)
        };
        let playing = self.playing;
        let snap_threshold = self.config.snap_threshold_secs;
        let correction_threshold = self.config.correction_threshold_secs;

        let Some(state) = self.sources.get_mut(&sample.source_id) else {
            return vec![unknown_source(&sample.source_id)];
        };

        state.frame_count += 1;
        state.expected_display_secs = sample.expected_display_secs;

        if is_master {
            state.record(sample.media_secs, sample.wall_secs);
            return Vec::new();
        }
        if state.pending_seek.is_some() {
            return Vec::new();
        }
        state.record(sample.media_secs, sample.wall_secs);

        let Some(expected) = expected else {
            return Vec::new();
        };
        if !playing {
            return Vec::new();
        }

        let measurement = DriftMeasurement::new(expected, sample.media_secs);
        let drift = measurement.drift_secs();
        state.accumulate(drift);
        if measurement.exceeds_threshold(correction_threshold) && state.phase == SyncPhase::InSync
        {
            state.phase = SyncPhase::Drifting;
        }

        if drift.abs() >= snap_threshold {
            return self.snap(&sample.source_id, expected, drift);
        }
        Vec::new()
    }

    /// Tick path: act on averaged drift.
    pub fn tick(&mut self, now_secs: f64) -> Vec<SyncEvent> {
        if !self.playing {
            return Vec::new();
        }
        let master_now = self.master_position(now_secs);
        let threshold = self.config.correction_threshold_secs;
        let gain = self.config.correction_gain;
        let max_corrections = self.config.max_smooth_corrections;

        let mut events = Vec::new();
        let mut escalate = Vec::new();

        for (source_id, state) in self.sources.iter_mut() {
            if self.master.as_ref() == Some(source_id)
                || state.pending_seek.is_some()
                || state.drift_samples() == 0
            {
                continue;
            }

            let average = state.average_drift();
            if average.abs() <= threshold {
                state.settle();
                continue;
            }

            if state.consecutive_corrections >= max_corrections {
                escalate.push((source_id.clone(), average));
                continue;
            }

            let adjustment = average * gain;
            state.reset_accumulator();
            state.consecutive_corrections += 1;
            state.phase = SyncPhase::Correcting;
            tracing::debug!(
                source = %source_id,
                average_drift_ms = average * 1_000.0,
                adjustment_ms = adjustment * 1_000.0,
                corrections = state.consecutive_corrections,
                "Smooth drift correction"
            );
            events.push(SyncEvent::Directive(SyncDirective {
                source_id: source_id.clone(),
                generation: state.generation,
                action: SyncAction::Nudge {
                    adjustment_secs: adjustment,
                },
            }));
        }

        if let Some(target) = master_now {
            for (source_id, average) in escalate {
                events.extend(self.snap(&source_id, target, average));
            }
        }
        events
    }

    /// A hard re-seek finished. Returns false when the completion is stale.
    pub fn seek_completed(
        &mut self,
        source_id: &SourceId,
        generation: Generation,
        reported_secs: f64,
        now_secs: f64,
    ) -> bool {
        let Some(state) = self.sources.get_mut(source_id) else {
            return false;
        };
        if state.pending_seek != Some(generation) {
            tracing::debug!(
                source = %source_id,
                generation = %generation,
                latest = %state.generation,
                "Discarding stale seek completion"
            );
            return false;
        }
        state.pending_seek = None;
        state.reset_accumulator();
        state.record(reported_secs, now_secs);
        state.phase = SyncPhase::InSync;
        true
    }

    /// A hard re-seek could not be carried out by the source.
    ///
    /// Clears the outstanding seek so sampling resumes; the failed attempt
    /// still counts toward `max_snaps`.
    pub fn seek_failed(&mut self, source_id: &SourceId, generation: Generation) -> bool {
        let Some(state) = self.sources.get_mut(source_id) else {
            return false;
        };
        if state.pending_seek != Some(generation) {
            return false;
        }
        tracing::warn!(
            source = %source_id,
            generation = %generation,
            snaps = state.consecutive_snaps,
            "Hard re-seek failed"
        );
        state.pending_seek = None;
        state.reset_accumulator();
        state.phase = SyncPhase::Drifting;
        true
    }

    /// Start the master clock at `master_secs`.
    pub fn play(&mut self, master_secs: f64, now_secs: f64) {
        self.playing = true;
        self.restart_all(master_secs, now_secs);
    }

    /// Freeze the master clock where it currently is.
    pub fn pause(&mut self, now_secs: f64) {
        let position = self.master_position(now_secs);
        self.playing = false;
        match position {
            Some(position) => self.restart_all(position, now_secs),
            None => {
                for state in self.sources.values_mut() {
                    state.bump_generation();
                    state.settle();
                }
            }
        }
    }

    /// Jump the master clock to `time_secs`.
    pub fn seek(&mut self, time_secs: f64, now_secs: f64) {
        self.restart_all(time_secs, now_secs);
    }

    fn restart_all(&mut self, master_secs: f64, now_secs: f64) {
        for (source_id, state) in self.sources.iter_mut() {
            state.bump_generation();
            state.settle();
            if self.master.as_ref() == Some(source_id) {
                state.record(master_secs, now_secs);
            } else {
                state.last_media_secs = None;
            }
        }
    }

    fn snap(&mut self, source_id: &SourceId, target_secs: f64, drift_secs: f64) -> Vec<SyncEvent> {
        let max_snaps = self.config.max_snaps;
        let Some(state) = self.sources.get_mut(source_id) else {
            return Vec::new();
        };

        let generation = state.bump_generation();
        state.pending_seek = Some(generation);
        state.reset_accumulator();
        state.consecutive_corrections = 0;
        state.consecutive_snaps += 1;
        state.phase = SyncPhase::Snapping;

        tracing::info!(
            source = %source_id,
            drift_ms = drift_secs * 1_000.0,
            target_secs,
            snaps = state.consecutive_snaps,
            "Hard re-seek"
        );

        let mut events = vec![SyncEvent::Directive(SyncDirective {
            source_id: source_id.clone(),
            generation,
            action: SyncAction::HardSeek { target_secs },
        })];
        if state.consecutive_snaps > max_snaps {
            tracing::warn!(
                source = %source_id,
                drift_ms = drift_secs * 1_000.0,
                snaps = state.consecutive_snaps,
                "Drift unrecoverable"
            );
            events.push(SyncEvent::DriftUnrecoverable {
                source_id: source_id.clone(),
                drift_secs,
                snaps: state.consecutive_snaps,
            });
        }
        events
    }

    /// Current health of every tracked source.
    pub fn stats(&self) -> Vec<SourceStats> {
        self.sources
            .iter()
            .map(|(source_id, state)| SourceStats {
                source_id: source_id.clone(),
                is_master: self.master.as_ref() == Some(source_id),
                frame_count: state.frame_count,
                average_drift_secs: state.average_drift(),
                last_drift_secs: state.last_drift_secs,
                phase: state.phase,
                consecutive_snaps: state.consecutive_snaps,
                generation: state.generation,
            })
            .collect()
    }
}

fn unknown_source(source_id: &SourceId) -> SyncEvent {
    tracing::warn!(source = %source_id, "Message for untracked source");
    SyncEvent::Error {
        message: format!("source {source_id} is not tracked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 500.0;

    fn sample(id: &str, media: f64, wall: f64) -> FrameSample {
        FrameSample {
            source_id: SourceId::new(id),
            media_secs: media,
            wall_secs: wall,
            expected_display_secs: wall + 1.0 / 60.0,
        }
    }

    fn playing_pair() -> DriftCoordinator {
        let mut coordinator = DriftCoordinator::new(SyncConfig::default());
        coordinator.init(SourceId::new("main"));
        coordinator.init(SourceId::new("overlay"));
        assert!(coordinator.set_master(SourceId::new("main")).is_empty());
        coordinator.play(10.0, T);
        coordinator
    }

    fn directives(events: &[SyncEvent]) -> Vec<&SyncDirective> {
        events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Directive(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_master_extrapolates_while_playing() {
        let coordinator = playing_pair();
        let position = coordinator.master_position(T + 0.25).unwrap();
        assert!((position - 10.25).abs() < 1e-9);
    }

    #[test]
    fn test_master_frozen_while_paused() {
        let mut coordinator = playing_pair();
        coordinator.pause(T + 1.0);
        let position = coordinator.master_position(T + 5.0).unwrap();
        assert!((position - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_drift_yields_one_smooth_correction() {
        let mut coordinator = playing_pair();

        let events = coordinator.on_frame(sample("overlay", 10.120, T + 0.100));
        assert!(events.is_empty(), "no hard seek for 20ms drift");

        let state = coordinator.state(&SourceId::new("overlay")).unwrap();
        assert!((state.last_drift_secs - 0.020).abs() < 1e-9);
        assert_eq!(state.phase, SyncPhase::Drifting);

        let events = coordinator.tick(T + 0.100);
        let found = directives(&events);
        assert_eq!(found.len(), 1);
        match found[0].action {
            SyncAction::Nudge { adjustment_secs } => {
                assert!((adjustment_secs - 0.010).abs() < 1e-9);
            }
            other => panic!("expected nudge, got {other:?}"),
        }

        assert!(coordinator.tick(T + 0.116).is_empty());
    }

    #[test]
    fn test_large_drift_snaps_on_event_path() {
        let mut coordinator = playing_pair();
        let events = coordinator.on_frame(sample("overlay", 10.400, T + 0.100));
        let found = directives(&events);
        assert_eq!(found.len(), 1);
        match found[0].action {
            SyncAction::HardSeek { target_secs } => assert!((target_secs - 10.1).abs() < 1e-9),
            other => panic!("expected hard seek, got {other:?}"),
        }
        assert_eq!(
            coordinator.state(&SourceId::new("overlay")).unwrap().phase,
            SyncPhase::Snapping
        );
    }

    #[test]
    fn test_samples_ignored_while_snap_pending() {
        let mut coordinator = playing_pair();
        let events = coordinator.on_frame(sample("overlay", 10.400, T + 0.100));
        assert_eq!(directives(&events).len(), 1);
        assert!(coordinator
            .on_frame(sample("overlay", 10.500, T + 0.116))
            .is_empty());
        assert!(coordinator.tick(T + 0.116).is_empty());
    }

    #[test]
    fn test_stale_completion_is_discarded() {
        let mut coordinator = playing_pair();
        let events = coordinator.on_frame(sample("overlay", 10.400, T + 0.100));
        let generation = directives(&events)[0].generation;
        let overlay = SourceId::new("overlay");

        coordinator.seek(3.0, T + 0.2);
        assert!(!coordinator.seek_completed(&overlay, generation, 10.1, T + 0.3));
    }

    #[test]
    fn test_matching_completion_returns_to_sync() {
        let mut coordinator = playing_pair();
        let events = coordinator.on_frame(sample("overlay", 10.400, T + 0.100));
        let generation = directives(&events)[0].generation;
        let overlay = SourceId::new("overlay");

        assert!(coordinator.seek_completed(&overlay, generation, 10.1, T + 0.1));
        let state = coordinator.state(&overlay).unwrap();
        assert_eq!(state.phase, SyncPhase::InSync);
        assert!(state.pending_seek.is_none());
        assert!(!coordinator.seek_completed(&overlay, generation, 10.1, T + 0.1));
    }

    #[test]
    fn test_failed_snap_resumes_sampling_and_escalates() {
        let max_snaps = SyncConfig::default().max_snaps;
        let mut coordinator = playing_pair();
        let overlay = SourceId::new("overlay");

        let mut snaps = 0;
        let mut unrecoverable = false;
        let mut wall = T;
        for _ in 0..600 {
            wall += 0.016;
            let master = coordinator.master_position(wall).unwrap();
            let mut events = coordinator.on_frame(sample("overlay", master + 1.0, wall));
            events.extend(coordinator.tick(wall));
            for event in events {
                match event {
                    SyncEvent::Directive(SyncDirective {
                        generation,
                        action: SyncAction::HardSeek { .. },
                        ..
                    }) => {
                        snaps += 1;
                        assert!(coordinator.seek_failed(&overlay, generation));
                    }
                    SyncEvent::DriftUnrecoverable { .. } => unrecoverable = true,
                    _ => {}
                }
            }
            if unrecoverable {
                break;
            }
        }

        assert_eq!(snaps, max_snaps + 1);
        assert!(unrecoverable);
        let state = coordinator.state(&overlay).unwrap();
        assert!(state.pending_seek.is_none());
    }

    #[test]
    fn test_seek_failure_for_superseded_generation_is_ignored() {
        let mut coordinator = playing_pair();
        let events = coordinator.on_frame(sample("overlay", 10.400, T + 0.100));
        let generation = directives(&events)[0].generation;
        let overlay = SourceId::new("overlay");

        coordinator.seek(3.0, T + 0.2);
        assert!(!coordinator.seek_failed(&overlay, generation));
        assert_eq!(
            coordinator.state(&overlay).unwrap().phase,
            SyncPhase::InSync
        );
    }

    #[test]
    fn test_converged_source_emits_nothing() {
        let mut coordinator = playing_pair();
        for i in 1..=20 {
            let wall = T + i as f64 * 0.016;
            coordinator.on_frame(sample("overlay", 10.0 + i as f64 * 0.016 + 0.001, wall));
            assert!(coordinator.tick(wall).is_empty());
        }
        assert_eq!(
            coordinator.state(&SourceId::new("overlay")).unwrap().phase,
            SyncPhase::InSync
        );
    }

    #[test]
    fn test_persistent_drift_escalates_to_snap_then_unrecoverable() {
        let config = SyncConfig::default();
        let max_corrections = config.max_smooth_corrections;
        let max_snaps = config.max_snaps;
        let mut coordinator = playing_pair();
        let overlay = SourceId::new("overlay");

        let mut nudges = 0;
        let mut snaps = 0;
        let mut unrecoverable = false;
        let mut wall = T;
        for _ in 0..200 {
            wall += 0.016;
            let master = coordinator.master_position(wall).unwrap();
            coordinator.on_frame(sample("overlay", master + 0.050, wall));
            for event in coordinator.tick(wall) {
                match event {
                    SyncEvent::Directive(SyncDirective {
                        generation,
                        action: SyncAction::HardSeek { target_secs },
                        ..
                    }) => {
                        snaps += 1;
                        coordinator.seek_completed(&overlay, generation, target_secs, wall);
                    }
                    SyncEvent::Directive(_) => nudges += 1,
                    SyncEvent::DriftUnrecoverable { .. } => unrecoverable = true,
                    _ => {}
                }
            }
            if unrecoverable {
                break;
            }
        }

        assert!(nudges >= max_corrections);
        assert_eq!(snaps, max_snaps + 1);
        assert!(unrecoverable);
    }

    #[test]
    fn test_no_correction_while_paused() {
        let mut coordinator = playing_pair();
        coordinator.pause(T);
        assert!(coordinator
            .on_frame(sample("overlay", 12.0, T + 0.1))
            .is_empty());
        assert!(coordinator.tick(T + 0.1).is_empty());
    }

    #[test]
    fn test_unknown_source_reports_error() {
        let mut coordinator = playing_pair();
        let events = coordinator.on_frame(sample("ghost", 1.0, T));
        assert!(matches!(events.as_slice(), [SyncEvent::Error { .. }]));
        assert!(matches!(
            coordinator.set_master(SourceId::new("ghost")).as_slice(),
            [SyncEvent::Error { .. }]
        ));
    }

    #[test]
    fn test_reinit_resets_state_but_advances_generation() {
        let mut coordinator = playing_pair();
        let overlay = SourceId::new("overlay");
        coordinator.on_frame(sample("overlay", 10.120, T + 0.1));
        let before = coordinator.state(&overlay).unwrap().generation;

        coordinator.init(overlay.clone());
        let state = coordinator.state(&overlay).unwrap();
        assert_eq!(state.frame_count, 0);
        assert_eq!(state.drift_samples(), 0);
        assert!(state.generation > before);
    }

    #[test]
    fn test_removing_master_clears_it() {
        let mut coordinator = playing_pair();
        coordinator.remove(&SourceId::new("main"));
        assert!(coordinator.master().is_none());
        assert!(coordinator.master_position(T).is_none());
    }

    #[test]
    fn test_stats_cover_every_source() {
        let coordinator = playing_pair();
        let stats = coordinator.stats();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().any(|s| s.is_master && s.source_id.as_str() == "main"));
    }
}
