//! Headless live playback against the clock coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

use lockstep_clock::ClockWorker;
use lockstep_common::{AppConfig, CompositorConfig, SessionClock, WallClock};
use lockstep_composition::CompositionEvent;
use lockstep_render_engine::{Compositor, PlaybackLoop};

#[derive(Debug, Default)]
struct Totals {
    frames: u64,
    loops: u64,
    nudges: usize,
    hard_seeks: usize,
    matte_resyncs: usize,
    skipped: usize,
    drift_reports: usize,
}

fn drain_notifications(
    notifications: &mut broadcast::Receiver<CompositionEvent>,
    totals: &mut Totals,
) {
    loop {
        match notifications.try_recv() {
            Ok(CompositionEvent::DriftUnrecoverable {
                source_id,
                drift_secs,
            }) => {
                totals.drift_reports += 1;
                println!(
                    "  [WARN] {source_id} could not be held in sync ({:.1} ms)",
                    drift_secs * 1_000.0
                );
            }
            Ok(CompositionEvent::SourceError { source_id, message }) => {
                println!("  [WARN] {source_id}: {message}");
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
}

pub async fn run(config: &AppConfig, path: PathBuf, secs: f64) -> anyhow::Result<()> {
    if !(secs > 0.0 && secs.is_finite()) {
        return Err(anyhow::anyhow!("--secs must be positive"));
    }

    let clock: Arc<dyn WallClock> = Arc::new(SessionClock::start());
    let (_, mut composition) = super::load_composition(&path, Arc::clone(&clock)).await?;

    let (handle, events, worker) = ClockWorker::spawn(config.sync.clone(), Arc::clone(&clock));
    composition.attach_clock(handle.clone())?;
    let mut notifications = composition.subscribe();

    // Previews render small; the composite math does not depend on size.
    let mut compositor = Compositor::from_config(&CompositorConfig {
        width: 480,
        height: 270,
        ..config.compositor.clone()
    })
    .map_err(|e| anyhow::anyhow!("Failed to create compositor: {e}"))?;
    let mut playback = PlaybackLoop::new(&config.playback, events);

    println!(
        "Playing '{}' for {secs:.1}s ({} backend, {} Hz)",
        composition.name(),
        compositor.backend_name(),
        config.playback.display_hz
    );

    composition.play().await?;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(
        1.0 / f64::from(config.playback.display_hz.max(1)),
    ));
    let deadline = clock.now_secs() + secs;
    let mut totals = Totals::default();

    while clock.now_secs() < deadline {
        ticker.tick().await;
        let Some(outcome) = playback
            .tick(&mut composition, &mut compositor, clock.now_ns())
            .await?
        else {
            continue;
        };
        totals.frames += 1;
        totals.loops += u64::from(outcome.looped);
        totals.nudges += outcome.nudges;
        totals.hard_seeks += outcome.hard_seeks;
        totals.matte_resyncs += outcome.matte_resyncs;
        totals.skipped += outcome.report.skipped.len();
        drain_notifications(&mut notifications, &mut totals);
    }

    composition.pause().await?;
    if let Err(e) = handle.shutdown() {
        tracing::debug!(error = %e, "Clock coordinator already stopped");
    }
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "Clock coordinator task failed");
    }

    drain_notifications(&mut notifications, &mut totals);

    println!("Playback summary:");
    println!("  Frames drawn: {}", totals.frames);
    println!("  Loops: {}", totals.loops);
    println!("  Nudges: {}", totals.nudges);
    println!("  Hard seeks: {}", totals.hard_seeks);
    println!("  Matte re-seeks: {}", totals.matte_resyncs);
    println!("  Layer skips: {}", totals.skipped);
    println!("  Unrecoverable drift reports: {}", totals.drift_reports);

    composition.release_all().await;
    Ok(())
}
