//! Show composition information.

use std::path::PathBuf;
use std::sync::Arc;

use lockstep_common::SessionClock;
use lockstep_composition::{FrameRange, Layer, MediaSource, SourceSlot};

pub fn describe_range(range: FrameRange) -> String {
    if range == FrameRange::UNBOUNDED {
        "all frames".to_string()
    } else {
        format!("frames {}..={}", range.start(), range.end())
    }
}

fn describe_slot(slot: Option<&SourceSlot>) -> String {
    match slot {
        None => "-".to_string(),
        Some(slot) => {
            let source = slot.source();
            match source.error() {
                Some(error) => format!("{} (error: {error})", slot.id()),
                None => format!("{} ({:.2}s)", slot.id(), source.duration()),
            }
        }
    }
}

fn print_layer(layer: &Layer, is_master: bool) {
    let mut tags = Vec::new();
    if layer.is_main_track() {
        tags.push("main");
    }
    if is_master {
        tags.push("master");
    }
    if layer.corner_pin.is_some() {
        tags.push("pinned");
    }

    println!(
        "  {} '{}' z={} {}{}",
        layer.id(),
        layer.name,
        layer.z_index,
        describe_range(layer.frame_range()),
        if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join(", "))
        }
    );
    println!("      media: {}", describe_slot(layer.media()));
    println!("      matte: {}", describe_slot(layer.matte()));
    if layer.source_offset_secs() > 0.0 {
        println!("      offset: {:.3}s", layer.source_offset_secs());
    }
}

pub async fn run(path: PathBuf) -> anyhow::Result<()> {
    let clock = Arc::new(SessionClock::start());
    let (document, composition) = super::load_composition(&path, clock).await?;

    println!("Composition: {}", composition.name());
    println!("  Document version: {}", document.version);
    println!("  Frame rate: {} fps", composition.frame_rate());
    println!(
        "  Duration: {:.2}s ({} frames){}",
        composition.duration(),
        composition.total_frames(),
        if composition.duration_override().is_some() {
            " [override]"
        } else {
            ""
        }
    );
    match composition.master_layer() {
        Some(id) => println!("  Master: {id}"),
        None => println!("  Master: none (composition clock)"),
    }
    println!();

    println!("Layers (paint order):");
    let mut layers: Vec<&Layer> = composition.layers().iter().collect();
    layers.sort_by_key(|l| l.z_index);
    for layer in layers {
        print_layer(layer, composition.master_layer() == Some(layer.id()));
    }

    Ok(())
}
