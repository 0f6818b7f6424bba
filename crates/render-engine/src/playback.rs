//! Live playback loop.
//!
//! One [`PlaybackLoop::tick`] is one display refresh: report source
//! positions to the clock coordinator, apply its corrections, keep mattes
//! next to their media, and draw the composite at a single composition
//! time shared by every layer.

use tokio::sync::mpsc;

use lockstep_clock::{ClockHandle, FrameSample, SyncAction, SyncDirective, SyncEvent};
use lockstep_common::{LayerId, LockstepResult, PlaybackConfig, RateController, SessionClock};
use lockstep_composition::{Composition, CompositionEvent, SourceRole};

use crate::compositor::{Compositor, RenderReport};

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Composition time the frame was drawn at.
    pub time_secs: f64,
    /// Playback wrapped from the end back to zero.
    pub looped: bool,
    pub nudges: usize,
    pub hard_seeks: usize,
    pub matte_resyncs: usize,
    pub report: RenderReport,
}

pub struct PlaybackLoop {
    rate: RateController,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    matte_tolerance_secs: f64,
    loop_playback: bool,
    /// Transport epoch at the previous drain; directives queued before a
    /// later play, pause or seek target a position that no longer applies.
    seen_epoch: Option<u64>,
}

impl PlaybackLoop {
    /// `events` is the receiver returned by `ClockWorker::spawn`.
    pub fn new(config: &PlaybackConfig, events: mpsc::UnboundedReceiver<SyncEvent>) -> Self {
        Self {
            rate: RateController::new(config.display_hz),
            events,
            matte_tolerance_secs: config.matte_tolerance_secs,
            loop_playback: config.loop_playback,
            seen_epoch: None,
        }
    }

    /// Run one refresh if the display interval has elapsed since the last.
    /// Returns `None` when it has not.
    pub async fn tick(
        &mut self,
        composition: &mut Composition,
        compositor: &mut Compositor,
        now_ns: u64,
    ) -> LockstepResult<Option<TickOutcome>> {
        if !self.rate.should_tick(now_ns) {
            return Ok(None);
        }

        let (looped, time_secs) = self.wrap_at_end(composition).await?;
        if composition.is_playing() {
            self.report_frames(composition);
        }

        let (nudges, hard_seeks) = self.apply_sync_events(composition).await;
        let matte_resyncs = self.sync_mattes(composition).await;

        let report = compositor.render_composition(composition, time_secs)?;
        composition.notify(CompositionEvent::TimeUpdate { time_secs });

        Ok(Some(TickOutcome {
            time_secs,
            looped,
            nudges,
            hard_seeks,
            matte_resyncs,
            report,
        }))
    }

    /// Loop back to zero (or stop) once playback passes the end.
    async fn wrap_at_end(&self, composition: &mut Composition) -> LockstepResult<(bool, f64)> {
        let duration = composition.duration().max(0.0);
        let time = composition.current_time();
        if !composition.is_playing() || duration <= 0.0 || time < duration {
            return Ok((false, time.clamp(0.0, duration)));
        }

        if self.loop_playback {
            tracing::debug!(duration_secs = duration, "Reached end of composition, looping");
            let time = composition.seek(0.0).await?;
            Ok((true, time))
        } else {
            tracing::info!(duration_secs = duration, "Reached end of composition");
            composition.pause().await?;
            Ok((false, duration))
        }
    }

    fn report_frames(&self, composition: &Composition) {
        let Some(handle) = composition.clock_handle() else {
            return;
        };
        let wall_secs = composition.clock().now_secs();
        let expected_display_secs =
            wall_secs + SessionClock::ns_to_secs(self.rate.interval_ns());

        for layer in composition.layers() {
            let Some(media) = layer.media().filter(|m| m.is_usable()) else {
                continue;
            };
            let sample = FrameSample {
                source_id: media.id().clone(),
                media_secs: layer.composition_time_of(media.source().current_time()),
                wall_secs,
                expected_display_secs,
            };
            if let Err(e) = handle.on_frame(sample) {
                tracing::warn!(error = %e, "Clock coordinator unavailable, frame reports dropped");
                return;
            }
        }
    }

    /// Drain everything the coordinator has sent. Returns (nudges, hard seeks).
    async fn apply_sync_events(&mut self, composition: &mut Composition) -> (usize, usize) {
        let mut nudges = 0;
        let mut hard_seeks = 0;
        let epoch = composition.transport_epoch();
        let stale = self.seen_epoch.is_some_and(|seen| seen != epoch);
        self.seen_epoch = Some(epoch);
        while let Ok(event) = self.events.try_recv() {
            match event {
                SyncEvent::Directive(directive) if stale => {
                    discard_directive(composition, directive);
                }
                SyncEvent::Directive(directive) => {
                    let is_seek = matches!(directive.action, SyncAction::HardSeek { .. });
                    if apply_directive(composition, directive).await {
                        if is_seek {
                            hard_seeks += 1;
                        } else {
                            nudges += 1;
                        }
                    }
                }
                SyncEvent::DriftUnrecoverable {
                    source_id,
                    drift_secs,
                    snaps,
                } => {
                    tracing::warn!(
                        source = %source_id,
                        drift_ms = drift_secs * 1_000.0,
                        snaps,
                        "Drift unrecoverable"
                    );
                    composition.notify(CompositionEvent::DriftUnrecoverable {
                        source_id,
                        drift_secs,
                    });
                }
                SyncEvent::Stats(stats) => {
                    for s in stats {
                        tracing::debug!(
                            source = %s.source_id,
                            master = s.is_master,
                            frames = s.frame_count,
                            average_drift_ms = s.average_drift_secs * 1_000.0,
                            phase = ?s.phase,
                            "Sync stats"
                        );
                    }
                }
                SyncEvent::Error { message } => {
                    tracing::warn!(%message, "Clock coordinator error");
                }
            }
        }
        (nudges, hard_seeks)
    }

    /// Re-seek mattes that wandered away from their layer's media.
    async fn sync_mattes(&self, composition: &mut Composition) -> usize {
        let layer_ids: Vec<LayerId> = composition
            .layers()
            .iter()
            .filter(|l| l.matte().is_some())
            .map(|l| l.id())
            .collect();

        let mut resyncs = 0;
        for layer_id in layer_ids {
            let Some(layer) = composition.layer_mut(layer_id) else {
                continue;
            };
            let Some(media_secs) = layer
                .media()
                .filter(|m| m.is_usable())
                .map(|m| m.source().current_time())
            else {
                continue;
            };
            let Some(matte) = layer.matte_mut() else {
                continue;
            };
            let offset = matte.source().current_time() - media_secs;
            if offset.abs() <= self.matte_tolerance_secs {
                continue;
            }
            tracing::debug!(
                layer = %layer_id,
                matte = %matte.id(),
                offset_ms = offset * 1_000.0,
                "Re-seeking matte"
            );
            match matte.seek(media_secs).await {
                Ok(_) => resyncs += 1,
                Err(e) => tracing::warn!(layer = %layer_id, error = %e, "Matte re-seek failed"),
            }
        }
        resyncs
    }
}

/// Drop a directive issued before the latest transport change. A dropped
/// hard re-seek is reported back so the coordinator stops waiting for it.
fn discard_directive(composition: &Composition, directive: SyncDirective) {
    tracing::debug!(
        source = %directive.source_id,
        generation = %directive.generation,
        "Dropping directive from before transport change"
    );
    if matches!(directive.action, SyncAction::HardSeek { .. }) {
        report_seek_failed(composition.clock_handle(), directive);
    }
}

fn report_seek_failed(handle: Option<&ClockHandle>, directive: SyncDirective) {
    if let Some(handle) = handle {
        if let Err(e) = handle.seek_failed(directive.source_id, directive.generation) {
            tracing::warn!(error = %e, "Could not report seek failure");
        }
    }
}

/// Apply one coordinator directive. Returns whether it took effect.
async fn apply_directive(composition: &mut Composition, directive: SyncDirective) -> bool {
    let Some((layer_id, SourceRole::Media)) = composition.layer_for_source(&directive.source_id)
    else {
        tracing::debug!(source = %directive.source_id, "Directive for an unbound source");
        return false;
    };
    let handle = composition.clock_handle().cloned();
    let Some(layer) = composition.layer_mut(layer_id) else {
        return false;
    };
    let offset = layer.source_offset_secs();

    match directive.action {
        SyncAction::Nudge { adjustment_secs } => {
            let Some(media) = layer.media_mut() else {
                return false;
            };
            // Positive drift means the source is ahead.
            media.source_mut().nudge(-adjustment_secs);
            true
        }
        SyncAction::HardSeek { target_secs } => {
            let media_target = layer.media_time_at(target_secs);
            let Some(media) = layer.media_mut() else {
                return false;
            };
            let reported = match media.seek(media_target).await {
                Ok(completion) => media.accept(&completion),
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(source = %directive.source_id, error = %message, "Hard re-seek failed");
                    composition.notify(CompositionEvent::SourceError {
                        source_id: directive.source_id.clone(),
                        message,
                    });
                    report_seek_failed(handle.as_ref(), directive);
                    return false;
                }
            };
            let Some(reported) = reported else {
                report_seek_failed(handle.as_ref(), directive);
                return false;
            };
            if let Some(handle) = handle {
                if let Err(e) = handle.seek_completed(
                    directive.source_id,
                    directive.generation,
                    reported + offset,
                ) {
                    tracing::warn!(error = %e, "Could not report seek completion");
                }
            }
            true
        }
    }
}
