//! Check system capabilities.

use lockstep_common::{config_file_path, CompositorConfig, ExportFormat};
use lockstep_render_engine::{command_exists, Compositor, FfmpegEncoder, GPU_AVAILABLE};

pub fn run() -> anyhow::Result<()> {
    println!("Lockstep System Check");
    println!("{}", "=".repeat(50));

    let software = Compositor::software(&CompositorConfig {
        width: 16,
        height: 16,
        ..CompositorConfig::default()
    });
    match software {
        Ok(_) => println!("[OK] Software compositor"),
        Err(e) => println!("[FAIL] Software compositor: {e}"),
    }

    if GPU_AVAILABLE {
        let gpu = Compositor::from_config(&CompositorConfig {
            width: 16,
            height: 16,
            backend: lockstep_common::BackendKind::Gpu,
            ..CompositorConfig::default()
        });
        match gpu {
            Ok(c) => println!("[OK] GPU compositor ({})", c.backend_name()),
            Err(e) => println!("[WARN] GPU compositor unavailable: {e}"),
        }
    } else {
        println!("[INFO] GPU compositor: not built (enable the `gpu` feature)");
    }

    let ffmpeg = FfmpegEncoder::new(ExportFormat::WebmVp9, 8000).is_available();
    if ffmpeg {
        println!("[OK] ffmpeg found: webm and mp4 export available");
    } else {
        println!("[WARN] ffmpeg not found on PATH: only png export is available");
    }
    if command_exists("ffprobe") {
        println!("[OK] ffprobe found");
    }

    println!("[INFO] Config file: {}", config_file_path().display());

    println!();
    if ffmpeg {
        println!("All export formats are available. Lockstep is ready.");
    } else {
        println!("Install ffmpeg to enable video export.");
    }

    Ok(())
}
