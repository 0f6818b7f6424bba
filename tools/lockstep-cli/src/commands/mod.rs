pub mod active;
pub mod check;
pub mod export;
pub mod info;
pub mod init;
pub mod play;
pub mod render_frame;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockstep_common::WallClock;
use lockstep_composition::{Composition, CompositionDocument, DefaultSourceFactory};

/// Directory relative media paths in a document resolve against.
pub fn base_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load a composition document and open its sources.
pub async fn load_composition(
    path: &Path,
    clock: Arc<dyn WallClock>,
) -> anyhow::Result<(CompositionDocument, Composition)> {
    let document = CompositionDocument::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load composition: {e}"))?;

    let base = base_dir(path);
    let missing = document.missing_files(&base);
    if !missing.is_empty() {
        let list: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        return Err(anyhow::anyhow!("Missing media files: {}", list.join(", ")));
    }

    let factory = DefaultSourceFactory::new(Arc::clone(&clock));
    let composition = Composition::from_document(&document, &factory, &base, clock)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open composition: {e}"))?;
    tracing::debug!(
        name = composition.name(),
        layers = composition.layers().len(),
        "Composition opened"
    );
    Ok((document, composition))
}
