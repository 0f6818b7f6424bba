//! Export a composition to video or a PNG sequence.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use lockstep_common::{AppConfig, CompositorConfig, ExportFormat, ExportSettings, SessionClock};
use lockstep_render_engine::{
    encoder_for, Compositor, ExportCoordinator, ExportProgress, ProgressCallback,
};

pub async fn run(
    config: &AppConfig,
    path: PathBuf,
    output: PathBuf,
    format: Option<ExportFormat>,
    width: Option<u32>,
    height: Option<u32>,
) -> anyhow::Result<()> {
    println!("Exporting composition at: {}", path.display());

    let clock = Arc::new(SessionClock::start());
    let (_, mut composition) = super::load_composition(&path, clock).await?;

    let settings = ExportSettings {
        format: format.unwrap_or(config.export.format),
        width: width.unwrap_or(config.export.width),
        height: height.unwrap_or(config.export.height),
        ..config.export.clone()
    };
    let mut compositor = Compositor::from_config(&CompositorConfig {
        width: settings.width,
        height: settings.height,
        ..config.compositor.clone()
    })
    .map_err(|e| anyhow::anyhow!("Failed to create compositor: {e}"))?;

    println!("  Output: {}", output.display());
    println!("  Format: {:?}", settings.format);
    println!("  Resolution: {}x{}", settings.width, settings.height);
    println!(
        "  Frames: {} @ {} fps",
        composition.total_frames(),
        composition.frame_rate()
    );

    let progress_cb: ProgressCallback = Box::new(|p: ExportProgress| {
        print!(
            "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s)  ",
            p.progress * 100.0,
            p.frames_rendered,
            p.total_frames,
            p.eta_secs,
        );
        let _ = std::io::stdout().flush();
    });

    let mut encoder = encoder_for(&settings);
    let mut coordinator = ExportCoordinator::new(settings).with_progress(progress_cb);

    let cancel = coordinator.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling export");
            cancel.cancel();
        }
    });

    let result = coordinator
        .run(&mut composition, &mut compositor, encoder.as_mut(), &output)
        .await;
    interrupt.abort();
    composition.release_all().await;

    match result {
        Ok(encoded) => {
            println!("\nExport complete: {}", encoded.path.display());
            println!("  {} frames, {} bytes", encoded.frames, encoded.bytes);
            Ok(())
        }
        Err(e) => {
            println!("\nExport failed: {e}");
            Err(e.into())
        }
    }
}
