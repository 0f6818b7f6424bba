//! Live playback ticks: pacing, looping, coordinator directives, mattes.

use std::sync::Arc;

use tokio::sync::mpsc;

use lockstep_clock::{SyncAction, SyncDirective, SyncEvent};
use lockstep_common::{
    CompositorConfig, Generation, LayerId, ManualClock, PlaybackConfig, SourceId, WallClock,
};
use lockstep_composition::sources::{SyntheticPattern, SyntheticSource};
use lockstep_composition::{Composition, CompositionEvent, FrameRange, LayerParams, MediaSource};
use lockstep_render_engine::{Compositor, PlaybackLoop};

const MS: u64 = 1_000_000;

struct Fixture {
    clock: ManualClock,
    composition: Composition,
    compositor: Compositor,
    main: LayerId,
    overlay: LayerId,
    directives: mpsc::UnboundedSender<SyncEvent>,
    playback: PlaybackLoop,
}

async fn fixture(config: PlaybackConfig) -> Fixture {
    let clock = ManualClock::new(50.0);
    let wall: Arc<dyn WallClock> = Arc::new(clock.clone());
    let mut composition = Composition::new(30.0, wall.clone()).unwrap();

    let main = composition.add_layer(LayerParams::main_track()).unwrap();
    composition
        .bind_media(
            main,
            Box::new(
                SyntheticSource::new("main", SyntheticPattern::Gradient, wall.clone())
                    .with_size(16, 9)
                    .with_duration(4.0),
            ),
        )
        .await
        .unwrap();
    composition
        .bind_matte(
            main,
            Box::new(SyntheticSource::new("main-matte", SyntheticPattern::Gray(200), wall.clone()).with_size(16, 9)),
        )
        .await
        .unwrap();
    composition.set_master_layer(main).unwrap();

    let overlay = composition
        .add_layer(LayerParams::composite(1, FrameRange::UNBOUNDED))
        .unwrap();
    composition
        .bind_media(
            overlay,
            Box::new(SyntheticSource::new("overlay", SyntheticPattern::Gray(64), wall.clone()).with_size(16, 9)),
        )
        .await
        .unwrap();

    let compositor = Compositor::software(&CompositorConfig {
        width: 16,
        height: 9,
        ..CompositorConfig::default()
    })
    .unwrap();
    let (directives, events) = mpsc::unbounded_channel();
    let playback = PlaybackLoop::new(&config, events);

    Fixture {
        clock,
        composition,
        compositor,
        main,
        overlay,
        directives,
        playback,
    }
}

fn media_time(composition: &Composition, layer: LayerId) -> f64 {
    composition
        .layer(layer)
        .unwrap()
        .media()
        .unwrap()
        .source()
        .current_time()
}

fn matte_time(composition: &Composition, layer: LayerId) -> f64 {
    composition
        .layer(layer)
        .unwrap()
        .matte()
        .unwrap()
        .source()
        .current_time()
}

fn directive(source: &str, action: SyncAction) -> SyncEvent {
    SyncEvent::Directive(SyncDirective {
        source_id: SourceId::new(source),
        generation: Generation(1),
        action,
    })
}

#[tokio::test]
async fn test_ticks_are_paced_to_display_rate() {
    let mut f = fixture(PlaybackConfig::default()).await;

    let first = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap();
    assert!(first.is_some());
    let early = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 5 * MS)
        .await
        .unwrap();
    assert!(early.is_none());
    let next = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 17 * MS)
        .await
        .unwrap();
    assert!(next.is_some());
}

#[tokio::test]
async fn test_tick_draws_every_active_layer_at_one_time() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.composition.seek(1.5).await.unwrap();
    let mut events = f.composition.subscribe();

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.time_secs, 1.5);
    assert_eq!(outcome.report.drawn, vec![f.main, f.overlay]);
    assert_eq!(outcome.report.time.seconds, 1.5);
    assert_eq!(
        events.try_recv().unwrap(),
        CompositionEvent::TimeUpdate { time_secs: 1.5 }
    );
}

#[tokio::test]
async fn test_nudge_moves_source_against_drift() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.composition.seek(2.0).await.unwrap();
    f.directives
        .send(directive("overlay", SyncAction::Nudge { adjustment_secs: 0.010 }))
        .unwrap();

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.nudges, 1);
    assert!((media_time(&f.composition, f.overlay) - 1.990).abs() < 1e-9);
    assert_eq!(media_time(&f.composition, f.main), 2.0);
}

#[tokio::test]
async fn test_hard_seek_accounts_for_source_offset() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.composition.update_source_offset(f.overlay, 0.5).unwrap();
    f.directives
        .send(directive("overlay", SyncAction::HardSeek { target_secs: 3.0 }))
        .unwrap();

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.hard_seeks, 1);
    assert_eq!(media_time(&f.composition, f.overlay), 2.5);
}

#[tokio::test]
async fn test_directives_queued_before_user_seek_are_dropped() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    f.directives
        .send(directive("overlay", SyncAction::HardSeek { target_secs: 3.0 }))
        .unwrap();
    f.composition.seek(0.5).await.unwrap();

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 17 * MS)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.hard_seeks, 0);
    assert_eq!(media_time(&f.composition, f.overlay), 0.5);
    assert_eq!(media_time(&f.composition, f.main), 0.5);

    // Directives sent after the transport settles apply again.
    f.directives
        .send(directive("overlay", SyncAction::Nudge { adjustment_secs: 0.010 }))
        .unwrap();
    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 34 * MS)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.nudges, 1);
    assert!((media_time(&f.composition, f.overlay) - 0.490).abs() < 1e-9);
}

#[tokio::test]
async fn test_directive_for_unknown_source_is_ignored() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.directives
        .send(directive("gone", SyncAction::Nudge { adjustment_secs: 0.5 }))
        .unwrap();

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.nudges, 0);
}

#[tokio::test]
async fn test_wandering_matte_is_resynced() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.composition.seek(2.0).await.unwrap();
    f.composition
        .layer_mut(f.main)
        .unwrap()
        .matte_mut()
        .unwrap()
        .source_mut()
        .nudge(-0.5);
    assert!((matte_time(&f.composition, f.main) - 1.5).abs() < 1e-9);

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.matte_resyncs, 1);
    assert_eq!(matte_time(&f.composition, f.main), 2.0);
}

#[tokio::test]
async fn test_playback_loops_at_end() {
    let mut f = fixture(PlaybackConfig::default()).await;
    f.composition.seek(3.5).await.unwrap();
    f.composition.play().await.unwrap();
    f.clock.advance(1.0);

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.looped);
    assert_eq!(outcome.time_secs, 0.0);
    assert!(f.composition.is_playing());
    assert_eq!(media_time(&f.composition, f.main), 0.0);
}

#[tokio::test]
async fn test_playback_stops_at_end_without_loop() {
    let mut f = fixture(PlaybackConfig {
        loop_playback: false,
        ..PlaybackConfig::default()
    })
    .await;
    f.composition.seek(3.5).await.unwrap();
    f.composition.play().await.unwrap();
    f.clock.advance(1.0);

    let outcome = f
        .playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap()
        .unwrap();

    assert!(!outcome.looped);
    assert_eq!(outcome.time_secs, 4.0);
    assert!(!f.composition.is_playing());
}

#[tokio::test]
async fn test_unrecoverable_drift_is_broadcast() {
    let mut f = fixture(PlaybackConfig::default()).await;
    let mut events = f.composition.subscribe();
    f.directives
        .send(SyncEvent::DriftUnrecoverable {
            source_id: SourceId::new("overlay"),
            drift_secs: 0.4,
            snaps: 3,
        })
        .unwrap();

    f.playback
        .tick(&mut f.composition, &mut f.compositor, 0)
        .await
        .unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        CompositionEvent::DriftUnrecoverable {
            source_id: SourceId::new("overlay"),
            drift_secs: 0.4,
        }
    );
}
