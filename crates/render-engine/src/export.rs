//! Frame-accurate export.
//!
//! Export does not trust playback timing. For every output frame each
//! source referenced by an active layer is seeked to the frame's target
//! time and re-seeked until it reports a position within epsilon; only
//! then is the composite drawn, captured and streamed to the encoder.
//! Whatever happens, the composition's transport is put back the way it
//! was found.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use lockstep_common::{ExportSettings, LayerId, LockstepError, LockstepResult};
use lockstep_composition::{Composition, CompositionTime, Layer, SourceRole, SourceSlot, TransportSnapshot};

use crate::compositor::Compositor;
use crate::encode::{encoder_for, run_blocking, EncodeSpec, EncodedOutput, VideoEncoder};

/// Progress callback for export rendering.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send>;

/// Export progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames captured so far.
    pub frames_rendered: u64,

    /// Total frames to render.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    /// Current stage.
    pub stage: ExportStage,
}

/// Stages of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStage {
    Idle,
    /// Sources paused and flushed to zero, framebuffer resized.
    Preparing,
    /// Per-frame seek, converge, render, capture.
    Capturing,
    /// Encoder finishing and muxing audio.
    Encoding,
    /// Restoring playback state.
    Finalizing,
    Failed,
}

impl ExportStage {
    pub fn can_transition_to(self, next: ExportStage) -> bool {
        use ExportStage::*;
        matches!(
            (self, next),
            (Idle | Failed, Preparing)
                | (Preparing, Capturing)
                | (Capturing, Encoding)
                | (Encoding, Finalizing)
                // Cancellation finalizes from wherever it was noticed.
                | (Preparing | Capturing, Finalizing)
                | (Finalizing, Idle)
                | (Preparing | Capturing | Encoding | Finalizing, Failed)
        )
    }
}

/// One output frame of an export.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePlan {
    pub index: u64,
    pub target_secs: f64,
    /// Layers drawn for this frame, in paint order.
    pub active_layers: Vec<LayerId>,
}

/// Every frame an export will produce. Building it twice from an
/// unmodified composition gives equal plans.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPlan {
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<FramePlan>,
}

impl ExportPlan {
    pub fn build(composition: &Composition, settings: &ExportSettings) -> LockstepResult<Self> {
        if settings.width == 0 || settings.height == 0 {
            return Err(LockstepError::config(format!(
                "export size must be non-zero, got {}x{}",
                settings.width, settings.height
            )));
        }
        let frame_rate = composition.frame_rate();
        let total_frames = composition.total_frames();
        if total_frames == 0 {
            return Err(LockstepError::composition(
                "composition has no duration; bind media to the main layer or set a duration",
            ));
        }

        let frames = (0..total_frames)
            .map(|index| {
                let target_secs = index as f64 / frame_rate;
                FramePlan {
                    index,
                    target_secs,
                    active_layers: composition.active_layer_ids(target_secs),
                }
            })
            .collect();

        Ok(Self {
            frame_rate,
            width: settings.width,
            height: settings.height,
            frames,
        })
    }

    pub fn total_frames(&self) -> u64 {
        self.frames.len() as u64
    }

    pub fn duration_secs(&self) -> f64 {
        self.total_frames() as f64 / self.frame_rate
    }
}

/// Cancels a running export at the next frame boundary.
#[derive(Debug, Clone, Default)]
pub struct ExportCancel(Arc<AtomicBool>);

impl ExportCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives an export through its stages.
pub struct ExportCoordinator {
    settings: ExportSettings,
    progress: Option<ProgressCallback>,
    cancel: ExportCancel,
    stage: ExportStage,
}

impl std::fmt::Debug for ExportCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportCoordinator")
            .field("settings", &self.settings)
            .field("stage", &self.stage)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ExportCoordinator {
    pub fn new(settings: ExportSettings) -> Self {
        Self {
            settings,
            progress: None,
            cancel: ExportCancel::new(),
            stage: ExportStage::Idle,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Handle that cancels this coordinator's exports.
    pub fn cancel_handle(&self) -> ExportCancel {
        self.cancel.clone()
    }

    pub fn stage(&self) -> ExportStage {
        self.stage
    }

    fn transition(&mut self, next: ExportStage) -> LockstepResult<()> {
        if !self.stage.can_transition_to(next) {
            return Err(LockstepError::composition(format!(
                "invalid export stage transition {:?} -> {:?}",
                self.stage, next
            )));
        }
        tracing::debug!(from = ?self.stage, to = ?next, "Export stage");
        self.stage = next;
        Ok(())
    }

    fn report(&self, frames_rendered: u64, total_frames: u64, started: Instant) {
        let Some(callback) = &self.progress else {
            return;
        };
        let progress = if total_frames == 0 {
            0.0
        } else {
            (frames_rendered as f64 / total_frames as f64).clamp(0.0, 1.0)
        };
        let elapsed = started.elapsed().as_secs_f64();
        let eta_secs = if frames_rendered > 0 {
            elapsed / frames_rendered as f64 * total_frames.saturating_sub(frames_rendered) as f64
        } else {
            0.0
        };
        callback(ExportProgress {
            progress,
            frames_rendered,
            total_frames,
            eta_secs,
            stage: self.stage,
        });
    }

    /// Export `composition` to `output`.
    ///
    /// On success, failure, or cancellation the composition's transport
    /// (time, loop flags, play state) and the compositor's size are
    /// restored. Failures and cancellation abort the encoder, which removes
    /// partial output.
    pub async fn run(
        &mut self,
        composition: &mut Composition,
        compositor: &mut Compositor,
        encoder: &mut dyn VideoEncoder,
        output: &Path,
    ) -> LockstepResult<EncodedOutput> {
        if !matches!(self.stage, ExportStage::Idle | ExportStage::Failed) {
            return Err(LockstepError::composition("an export is already running"));
        }
        self.transition(ExportStage::Preparing)?;

        let plan = match ExportPlan::build(composition, &self.settings) {
            Ok(plan) => plan,
            Err(e) => {
                self.stage = ExportStage::Failed;
                return Err(e);
            }
        };
        tracing::info!(
            composition = composition.name(),
            frames = plan.total_frames(),
            frame_rate = plan.frame_rate,
            width = plan.width,
            height = plan.height,
            encoder = encoder.name(),
            output = %output.display(),
            "Starting export"
        );

        let saved_transport = composition.capture_transport();
        let saved_size = compositor.size();
        let started = Instant::now();

        let result = self
            .capture_and_encode(composition, compositor, encoder, output, &plan, started)
            .await;

        match result {
            Ok(encoded) => {
                self.transition(ExportStage::Finalizing)?;
                restore(composition, compositor, &saved_transport, saved_size).await;
                self.report(plan.total_frames(), plan.total_frames(), started);
                self.transition(ExportStage::Idle)?;
                tracing::info!(
                    output = %encoded.path.display(),
                    frames = encoded.frames,
                    bytes = encoded.bytes,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Export complete"
                );
                Ok(encoded)
            }
            Err(LockstepError::Cancelled) => {
                run_blocking(|| encoder.abort());
                self.stage = ExportStage::Finalizing;
                restore(composition, compositor, &saved_transport, saved_size).await;
                self.stage = ExportStage::Idle;
                self.cancel.reset();
                tracing::info!("Export cancelled");
                Err(LockstepError::Cancelled)
            }
            Err(e) => {
                tracing::error!(error = %e, stage = ?self.stage, "Export failed");
                self.stage = ExportStage::Failed;
                run_blocking(|| encoder.abort());
                restore(composition, compositor, &saved_transport, saved_size).await;
                Err(e)
            }
        }
    }

    async fn capture_and_encode(
        &mut self,
        composition: &mut Composition,
        compositor: &mut Compositor,
        encoder: &mut dyn VideoEncoder,
        output: &Path,
        plan: &ExportPlan,
        started: Instant,
    ) -> LockstepResult<EncodedOutput> {
        composition.pause().await?;
        set_looping(composition, false);
        compositor.resize(plan.width, plan.height)?;
        composition.seek(0.0).await?;

        let spec = EncodeSpec {
            width: plan.width,
            height: plan.height,
            frame_rate: plan.frame_rate,
            output: output.to_path_buf(),
        };
        run_blocking(|| encoder.begin(&spec))?;
        self.transition(ExportStage::Capturing)?;
        self.report(0, plan.total_frames(), started);

        for frame in &plan.frames {
            if self.cancel.is_cancelled() {
                tracing::info!(frame = frame.index, "Export cancellation requested");
                return Err(LockstepError::Cancelled);
            }

            self.converge_frame(composition, frame).await?;

            let layers: Vec<&Layer> = frame
                .active_layers
                .iter()
                .filter_map(|id| composition.layer(*id))
                .collect();
            let time = CompositionTime::of_frame(frame.index, plan.frame_rate);
            let report = compositor.render(&layers, time)?;
            if !report.skipped.is_empty() {
                tracing::debug!(frame = frame.index, skipped = ?report.skipped, "Layers skipped in export frame");
            }

            let image = compositor.capture()?;
            run_blocking(|| encoder.push_frame(&image))?;
            self.report(frame.index + 1, plan.total_frames(), started);
        }

        self.transition(ExportStage::Encoding)?;
        self.report(plan.total_frames(), plan.total_frames(), started);
        let audio = composition
            .main_layer()
            .and_then(|l| l.media())
            .and_then(|m| m.source().audio_track());
        run_blocking(|| encoder.finish(audio.as_deref()))
    }

    /// Seek every source of the frame's active layers onto its target.
    async fn converge_frame(
        &self,
        composition: &mut Composition,
        frame: &FramePlan,
    ) -> LockstepResult<()> {
        for layer_id in &frame.active_layers {
            for role in [SourceRole::Media, SourceRole::Matte] {
                let Some(layer) = composition.layer_mut(*layer_id) else {
                    break;
                };
                let target = layer.media_time_at(frame.target_secs);
                let slot = match role {
                    SourceRole::Media => layer.media_mut(),
                    SourceRole::Matte => layer.matte_mut(),
                };
                if let Some(slot) = slot {
                    converge_source(slot, target, frame.index, &self.settings).await?;
                }
            }
        }
        Ok(())
    }
}

/// Seek `slot` to `target_secs` until it reports a time within epsilon.
/// Returns the number of seeks issued.
pub async fn converge_source(
    slot: &mut SourceSlot,
    target_secs: f64,
    frame: u64,
    settings: &ExportSettings,
) -> LockstepResult<u32> {
    let ready_timeout = Duration::from_millis(settings.ready_timeout_ms);
    slot.wait_ready(ready_timeout).await?;

    let attempts = settings.max_seek_retries.saturating_add(1);
    let mut reported_secs = f64::NAN;
    for attempt in 1..=attempts {
        let completion = slot.seek(target_secs).await?;
        let Some(reported) = slot.accept(&completion) else {
            continue;
        };
        reported_secs = reported;
        if (reported - target_secs).abs() <= settings.seek_epsilon_secs {
            if attempt > 1 {
                tracing::debug!(source = %slot.id(), frame, attempt, "Seek converged after retries");
            }
            slot.wait_ready(ready_timeout).await?;
            return Ok(attempt);
        }
        tracing::debug!(
            source = %slot.id(),
            frame,
            attempt,
            target_secs,
            reported_secs = reported,
            "Seek missed target"
        );
    }

    Err(LockstepError::SeekConvergence {
        source_id: slot.id().clone(),
        frame,
        target_secs,
        reported_secs,
        attempts,
    })
}

fn set_looping(composition: &mut Composition, looping: bool) {
    let ids: Vec<LayerId> = composition.layers().iter().map(|l| l.id()).collect();
    for id in ids {
        if let Some(layer) = composition.layer_mut(id) {
            if let Some(media) = layer.media_mut() {
                media.source_mut().set_looping(looping);
            }
            if let Some(matte) = layer.matte_mut() {
                matte.source_mut().set_looping(looping);
            }
        }
    }
}

async fn restore(
    composition: &mut Composition,
    compositor: &mut Compositor,
    transport: &TransportSnapshot,
    size: (u32, u32),
) {
    if let Err(e) = compositor.resize(size.0, size.1) {
        tracing::warn!(error = %e, "Failed to restore compositor size");
    }
    if let Err(e) = composition.restore_transport(transport).await {
        tracing::warn!(error = %e, "Failed to restore playback state after export");
    }
}

/// Export with the encoder `settings.format` selects.
pub async fn export_composition(
    composition: &mut Composition,
    compositor: &mut Compositor,
    settings: ExportSettings,
    output: &Path,
    progress: Option<ProgressCallback>,
) -> LockstepResult<EncodedOutput> {
    let mut encoder = encoder_for(&settings);
    let mut coordinator = ExportCoordinator::new(settings);
    if let Some(callback) = progress {
        coordinator = coordinator.with_progress(callback);
    }
    coordinator
        .run(composition, compositor, encoder.as_mut(), output)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ExportStage::*;
        let path = [Idle, Preparing, Capturing, Encoding, Finalizing, Idle];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        use ExportStage::*;
        assert!(!Idle.can_transition_to(Capturing));
        assert!(!Capturing.can_transition_to(Preparing));
        assert!(!Encoding.can_transition_to(Capturing));
        assert!(!Idle.can_transition_to(Failed));
        assert!(Capturing.can_transition_to(Failed));
        assert!(Capturing.can_transition_to(Finalizing));
        assert!(Failed.can_transition_to(Preparing));
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let cancel = ExportCancel::new();
        let handle = cancel.clone();
        assert!(!cancel.is_cancelled());
        handle.cancel();
        assert!(cancel.is_cancelled());
        cancel.reset();
        assert!(!handle.is_cancelled());
    }
}
