//! Export: planning, seek convergence, encoding, cancellation and restore.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbaImage;

use lockstep_common::{
    CompositorConfig, ExportFormat, ExportSettings, LayerId, LockstepError, LockstepResult,
    ManualClock, WallClock,
};
use lockstep_composition::sources::{SeekProfile, SyntheticPattern, SyntheticSource};
use lockstep_composition::{Composition, FrameRange, LayerParams, SourceSlot};
use lockstep_render_engine::{
    converge_source, export_composition, Compositor, EncodeSpec, EncodedOutput, ExportCoordinator,
    ExportPlan, ExportProgress, ExportStage, PngSequenceEncoder, VideoEncoder,
};

fn clock() -> Arc<dyn WallClock> {
    Arc::new(ManualClock::new(100.0))
}

fn settings() -> ExportSettings {
    ExportSettings {
        width: 16,
        height: 8,
        format: ExportFormat::PngSequence,
        ready_timeout_ms: 50,
        ..ExportSettings::default()
    }
}

fn compositor() -> Compositor {
    Compositor::software(&CompositorConfig {
        width: 32,
        height: 18,
        ..CompositorConfig::default()
    })
    .unwrap()
}

#[derive(Clone, Default)]
struct RecordingEncoder {
    spec: Arc<Mutex<Option<EncodeSpec>>>,
    frames: Arc<Mutex<Vec<RgbaImage>>>,
    audio: Arc<Mutex<Option<PathBuf>>>,
    aborted: Arc<AtomicBool>,
}

impl RecordingEncoder {
    fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl VideoEncoder for RecordingEncoder {
    fn name(&self) -> &str {
        "recording"
    }

    fn begin(&mut self, spec: &EncodeSpec) -> LockstepResult<()> {
        *self.spec.lock().unwrap() = Some(spec.clone());
        Ok(())
    }

    fn push_frame(&mut self, frame: &RgbaImage) -> LockstepResult<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn finish(&mut self, audio: Option<&Path>) -> LockstepResult<EncodedOutput> {
        *self.audio.lock().unwrap() = audio.map(Path::to_path_buf);
        let spec = self.spec.lock().unwrap().clone().unwrap();
        Ok(EncodedOutput {
            path: spec.output,
            frames: self.frame_count() as u64,
            bytes: 0,
            container: "test".to_string(),
        })
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// One-second composition with a frame-counter main layer.
async fn counter_composition(clock: &Arc<dyn WallClock>) -> (Composition, LayerId) {
    let mut composition = Composition::new(30.0, clock.clone()).unwrap();
    let main = composition.add_layer(LayerParams::main_track()).unwrap();
    let source = SyntheticSource::new("main", SyntheticPattern::FrameCounter, clock.clone())
        .with_size(16, 8)
        .with_duration(1.0);
    composition.bind_media(main, Box::new(source)).await.unwrap();
    composition.set_master_layer(main).unwrap();
    (composition, main)
}

#[tokio::test]
async fn test_plan_matches_frame_ranges_and_is_deterministic() {
    let clock = clock();
    let mut composition = Composition::new(30.0, clock.clone()).unwrap();
    let main = composition.add_layer(LayerParams::main_track()).unwrap();
    let overlay = composition
        .add_layer(LayerParams::composite(1, FrameRange::new(68, 152).unwrap()))
        .unwrap();
    composition
        .bind_media(
            main,
            Box::new(SyntheticSource::new("main", SyntheticPattern::Gradient, clock.clone()).with_duration(8.0)),
        )
        .await
        .unwrap();

    let plan = ExportPlan::build(&composition, &settings()).unwrap();
    assert_eq!(plan.total_frames(), 240);
    assert_eq!(plan.frames[75].active_layers, vec![main, overlay]);
    assert_eq!(plan.frames[15].active_layers, vec![main]);
    assert_eq!(plan.frames[68].active_layers, vec![main, overlay]);
    assert_eq!(plan.frames[153].active_layers, vec![main]);
    for frame in &plan.frames {
        assert_eq!(frame.target_secs, frame.index as f64 / 30.0);
    }

    assert_eq!(plan, ExportPlan::build(&composition, &settings()).unwrap());
}

#[tokio::test]
async fn test_plan_rejects_empty_composition() {
    let composition = Composition::new(30.0, clock()).unwrap();
    assert!(ExportPlan::build(&composition, &settings()).is_err());
}

#[tokio::test]
async fn test_export_streams_every_frame_in_order() {
    let clock = clock();
    let (mut composition, main) = counter_composition(&clock).await;
    composition.clear_master();
    let source = SyntheticSource::new("main-with-audio", SyntheticPattern::FrameCounter, clock.clone())
        .with_size(16, 8)
        .with_duration(1.0)
        .with_audio("/media/main.opus");
    composition.bind_media(main, Box::new(source)).await.unwrap();
    let mut compositor = compositor();
    let mut encoder = RecordingEncoder::default();
    let mut coordinator = ExportCoordinator::new(settings());

    let output = coordinator
        .run(&mut composition, &mut compositor, &mut encoder, Path::new("/tmp/out"))
        .await
        .unwrap();

    assert_eq!(output.frames, 30);
    assert_eq!(coordinator.stage(), ExportStage::Idle);
    let frames = encoder.frames.lock().unwrap();
    for (index, frame) in frames.iter().enumerate() {
        assert_eq!(frame.dimensions(), (16, 8));
        // The frame counter pattern carries the source frame in red.
        assert_eq!(frame.get_pixel(8, 4).0[0] as usize, index);
    }
    assert_eq!(
        encoder.audio.lock().unwrap().as_deref(),
        Some(Path::new("/media/main.opus"))
    );
    assert_eq!(compositor.size(), (32, 18));
}

#[tokio::test]
async fn test_progress_reports_frames_and_stages() {
    let clock = clock();
    let (mut composition, _main) = counter_composition(&clock).await;
    let mut compositor = compositor();
    let mut encoder = RecordingEncoder::default();

    let reports: Arc<Mutex<Vec<ExportProgress>>> = Arc::default();
    let sink = reports.clone();
    let mut coordinator = ExportCoordinator::new(settings())
        .with_progress(Box::new(move |p| sink.lock().unwrap().push(p)));

    coordinator
        .run(&mut composition, &mut compositor, &mut encoder, Path::new("/tmp/out"))
        .await
        .unwrap();

    let reports = reports.lock().unwrap();
    let first = reports.first().unwrap();
    assert_eq!(first.stage, ExportStage::Capturing);
    assert_eq!(first.frames_rendered, 0);
    let last = reports.last().unwrap();
    assert_eq!(last.stage, ExportStage::Finalizing);
    assert_eq!(last.progress, 1.0);
    assert_eq!(last.total_frames, 30);
    assert!(reports
        .windows(2)
        .all(|w| w[0].frames_rendered <= w[1].frames_rendered));
}

#[tokio::test]
async fn test_converge_retries_until_within_epsilon() {
    let clock = clock();
    let source = SyntheticSource::new("flaky", SyntheticPattern::Gradient, clock)
        .with_seek_profile(SeekProfile {
            latency: Duration::ZERO,
            inexact_seeks: 2,
            miss_secs: 0.05,
        });
    let seeks = source.seek_counter();
    let mut slot = SourceSlot::new(Box::new(source));

    let attempts = converge_source(&mut slot, 1.0, 30, &settings()).await.unwrap();
    assert_eq!(attempts, 3);
    assert_eq!(seeks.load(Ordering::SeqCst), 3);
    assert_eq!(slot.source().current_time(), 1.0);
}

#[tokio::test]
async fn test_converge_gives_up_after_retries() {
    let clock = clock();
    let source = SyntheticSource::new("stuck", SyntheticPattern::Gradient, clock)
        .with_seek_profile(SeekProfile::never_converges(0.05));
    let mut slot = SourceSlot::new(Box::new(source));
    let settings = ExportSettings {
        max_seek_retries: 2,
        ..settings()
    };

    match converge_source(&mut slot, 1.0, 30, &settings).await {
        Err(LockstepError::SeekConvergence {
            frame,
            attempts,
            reported_secs,
            ..
        }) => {
            assert_eq!(frame, 30);
            assert_eq!(attempts, 3);
            assert!((reported_secs - 1.05).abs() < 1e-9);
        }
        other => panic!("expected SeekConvergence, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_export_aborts_and_restores() {
    let clock = clock();
    let mut composition = Composition::new(30.0, clock.clone()).unwrap();
    let main = composition.add_layer(LayerParams::main_track()).unwrap();
    let source = SyntheticSource::new("stuck", SyntheticPattern::Gradient, clock.clone())
        .with_duration(1.0)
        .with_seek_profile(SeekProfile::never_converges(0.05));
    composition.bind_media(main, Box::new(source)).await.unwrap();
    composition.seek(0.5).await.unwrap();
    let before = composition.capture_transport();

    let mut compositor = compositor();
    let mut encoder = RecordingEncoder::default();
    let mut coordinator = ExportCoordinator::new(settings());
    let result = coordinator
        .run(&mut composition, &mut compositor, &mut encoder, Path::new("/tmp/out"))
        .await;

    assert!(matches!(result, Err(LockstepError::SeekConvergence { .. })));
    assert_eq!(coordinator.stage(), ExportStage::Failed);
    assert!(encoder.aborted.load(Ordering::SeqCst));
    assert_eq!(encoder.frame_count(), 0);
    assert_eq!(compositor.size(), (32, 18));
    // The stuck source lands 50 ms past every seek, the restoring one included.
    let after = composition.capture_transport();
    assert_eq!(after.playing, before.playing);
    assert!((before.sources[0].time_secs - 0.55).abs() < 1e-9);
    assert!((after.sources[0].time_secs - 0.60).abs() < 1e-9);
}

#[tokio::test]
async fn test_unready_source_fails_export() {
    let clock = clock();
    let mut composition = Composition::new(30.0, clock.clone()).unwrap();
    let main = composition.add_layer(LayerParams::main_track()).unwrap();
    let source = SyntheticSource::new("cold", SyntheticPattern::Gradient, clock.clone())
        .with_duration(1.0)
        .with_ready(false);
    composition.bind_media(main, Box::new(source)).await.unwrap();

    let mut compositor = compositor();
    let mut encoder = RecordingEncoder::default();
    let mut coordinator = ExportCoordinator::new(settings());
    let result = coordinator
        .run(&mut composition, &mut compositor, &mut encoder, Path::new("/tmp/out"))
        .await;

    match result {
        Err(LockstepError::SourceNotReady { source_id }) => assert_eq!(source_id.as_str(), "cold"),
        other => panic!("expected SourceNotReady, got {other:?}"),
    }
    assert!(encoder.aborted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancellation_restores_playback_state_exactly() {
    let clock = clock();
    let (mut composition, main) = counter_composition(&clock).await;
    composition
        .layer_mut(main)
        .unwrap()
        .media_mut()
        .unwrap()
        .source_mut()
        .set_looping(true);
    composition.seek(0.4).await.unwrap();
    composition.play().await.unwrap();
    let before = composition.capture_transport();
    assert!(before.playing);

    let mut compositor = compositor();
    let mut encoder = RecordingEncoder::default();
    let mut coordinator = ExportCoordinator::new(settings());
    let cancel = coordinator.cancel_handle();
    coordinator = coordinator.with_progress(Box::new(move |p| {
        if p.frames_rendered == 10 {
            cancel.cancel();
        }
    }));

    let result = coordinator
        .run(&mut composition, &mut compositor, &mut encoder, Path::new("/tmp/out"))
        .await;

    assert!(matches!(result, Err(LockstepError::Cancelled)));
    assert_eq!(encoder.frame_count(), 10);
    assert!(encoder.aborted.load(Ordering::SeqCst));
    assert_eq!(coordinator.stage(), ExportStage::Idle);
    assert!(!coordinator.cancel_handle().is_cancelled());
    assert_eq!(compositor.size(), (32, 18));

    let after = composition.capture_transport();
    assert_eq!(after, before);
    let source = composition.layer(main).unwrap().media().unwrap().source();
    assert!(source.is_looping());
    assert!(source.is_playing());
    assert_eq!(composition.current_time(), 0.4);
}

#[tokio::test]
async fn test_png_sequence_export_end_to_end() {
    let dir = std::env::temp_dir().join("lockstep_test_export_png");
    let _ = std::fs::remove_dir_all(&dir);

    let clock = clock();
    let (mut composition, _main) = counter_composition(&clock).await;
    let mut compositor = compositor();

    let output = export_composition(&mut composition, &mut compositor, settings(), &dir, None)
        .await
        .unwrap();

    assert_eq!(output.frames, 30);
    assert!(PngSequenceEncoder::frame_path(&dir, 29).exists());
    assert!(!PngSequenceEncoder::frame_path(&dir, 30).exists());
    let _ = std::fs::remove_dir_all(&dir);
}

/// Encoder that drives async I/O synchronously from inside its calls, the
/// way a bridge to an async writer would.
struct RuntimeBridgeEncoder {
    runtime: tokio::runtime::Handle,
    inner: RecordingEncoder,
}

impl RuntimeBridgeEncoder {
    fn flush(&self) {
        self.runtime
            .block_on(tokio::time::sleep(Duration::from_millis(1)));
    }
}

impl VideoEncoder for RuntimeBridgeEncoder {
    fn name(&self) -> &str {
        "bridge"
    }

    fn begin(&mut self, spec: &EncodeSpec) -> LockstepResult<()> {
        self.flush();
        self.inner.begin(spec)
    }

    fn push_frame(&mut self, frame: &RgbaImage) -> LockstepResult<()> {
        self.flush();
        self.inner.push_frame(frame)
    }

    fn finish(&mut self, audio: Option<&Path>) -> LockstepResult<EncodedOutput> {
        self.flush();
        self.inner.finish(audio)
    }

    fn abort(&mut self) {
        self.inner.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encoder_calls_may_block_on_multi_thread_runtime() {
    let clock = clock();
    let (mut composition, _main) = counter_composition(&clock).await;
    let mut compositor = compositor();
    let mut encoder = RuntimeBridgeEncoder {
        runtime: tokio::runtime::Handle::current(),
        inner: RecordingEncoder::default(),
    };
    let mut coordinator = ExportCoordinator::new(settings());

    let output = coordinator
        .run(&mut composition, &mut compositor, &mut encoder, Path::new("/tmp/bridge"))
        .await
        .unwrap();

    assert_eq!(output.frames, 30);
    assert_eq!(encoder.inner.frame_count(), 30);
    assert_eq!(coordinator.stage(), ExportStage::Idle);
}
