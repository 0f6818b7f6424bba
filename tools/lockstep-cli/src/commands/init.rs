//! Write a sample composition document.

use std::path::PathBuf;

use lockstep_composition::CompositionDocument;

pub fn run(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }

    let document = CompositionDocument::sample();
    document
        .save(&path)
        .map_err(|e| anyhow::anyhow!("Failed to write composition: {e}"))?;

    println!("Created composition '{}' at {}", document.name, path.display());
    println!("  Frame rate: {} fps", document.frame_rate);
    println!("  Layers: {}", document.layers.len());
    println!();
    println!("Try:");
    println!("  lockstep info {}", path.display());
    println!(
        "  lockstep render-frame {} --time 2.5 --output frame.png",
        path.display()
    );

    Ok(())
}
