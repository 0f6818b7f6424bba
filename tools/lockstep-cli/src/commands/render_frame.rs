//! Render one composite frame to a PNG.

use std::path::PathBuf;
use std::sync::Arc;

use lockstep_common::{AppConfig, CompositorConfig, SessionClock};
use lockstep_render_engine::Compositor;

pub async fn run(
    config: &AppConfig,
    path: PathBuf,
    time: f64,
    output: PathBuf,
    width: Option<u32>,
    height: Option<u32>,
) -> anyhow::Result<()> {
    let clock = Arc::new(SessionClock::start());
    let (_, mut composition) = super::load_composition(&path, clock).await?;

    let compositor_config = CompositorConfig {
        width: width.unwrap_or(config.compositor.width),
        height: height.unwrap_or(config.compositor.height),
        ..config.compositor.clone()
    };
    let mut compositor = Compositor::from_config(&compositor_config)
        .map_err(|e| anyhow::anyhow!("Failed to create compositor: {e}"))?;

    let time = composition.seek(time).await?;
    let report = compositor.render_composition(&composition, time)?;
    let frame = compositor.capture()?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    frame
        .save(&output)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", output.display()))?;

    println!(
        "Rendered {:.3}s at {}x{} ({} backend) to {}",
        time,
        compositor_config.width,
        compositor_config.height,
        compositor.backend_name(),
        output.display()
    );
    println!("  Drawn: {}", report.drawn.len());
    for skipped in &report.skipped {
        println!("  Skipped {}: {}", skipped.layer_id, skipped.reason);
    }

    composition.release_all().await;
    Ok(())
}
