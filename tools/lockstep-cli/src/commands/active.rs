//! List the layers drawn at a composition time.

use std::path::PathBuf;
use std::sync::Arc;

use lockstep_common::SessionClock;

use super::info::describe_range;

pub async fn run(path: PathBuf, time: f64) -> anyhow::Result<()> {
    if !time.is_finite() || time < 0.0 {
        return Err(anyhow::anyhow!("time must be a non-negative number of seconds"));
    }

    let clock = Arc::new(SessionClock::start());
    let (_, composition) = super::load_composition(&path, clock).await?;

    let at = composition.time_at(time);
    match at.frame() {
        Some(frame) => println!("At {time:.3}s (frame {frame}):"),
        None => println!("At {time:.3}s:"),
    }
    if time >= composition.duration() {
        println!("  (past the end of the composition at {:.2}s)", composition.duration());
    }

    let active = composition.active_layers(time);
    if active.is_empty() {
        println!("  No active layers.");
        return Ok(());
    }
    for layer in active {
        println!(
            "  {} '{}' z={} {}",
            layer.id(),
            layer.name,
            layer.z_index,
            describe_range(layer.frame_range())
        );
    }

    Ok(())
}
