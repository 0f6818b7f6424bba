//! Composition documents: the JSON form of a composition and its sources.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lockstep_common::{LayerId, LockstepError, LockstepResult, SourceId, WallClock};

use crate::composition::Composition;
use crate::geometry::Point2D;
use crate::layer::{CornerPin, FrameRange, LayerParams};
use crate::media::MediaSource;
use crate::sources::{ImageSequenceSource, SyntheticPattern, SyntheticSource};

/// Current document format version.
pub const DOCUMENT_VERSION: u32 = 1;

/// A saved composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionDocument {
    pub version: u32,
    pub name: String,
    pub frame_rate: f64,
    #[serde(default)]
    pub duration_override: Option<f64>,
    #[serde(default)]
    pub master: Option<LayerId>,
    #[serde(default)]
    pub layers: Vec<LayerDocument>,
}

/// One layer with the sources bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDocument {
    pub id: LayerId,
    #[serde(default)]
    pub params: LayerParams,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub matte: Option<MediaDescriptor>,
}

/// How to open a media source. Relative paths resolve against the
/// document's directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaDescriptor {
    Synthetic {
        id: SourceId,
        pattern: SyntheticPattern,
        #[serde(default = "default_synthetic_width")]
        width: u32,
        #[serde(default = "default_synthetic_height")]
        height: u32,
        duration_secs: f64,
        #[serde(default = "default_frame_rate")]
        frame_rate: f64,
    },
    ImageSequence {
        id: SourceId,
        path: PathBuf,
        #[serde(default = "default_frame_rate")]
        frame_rate: f64,
        #[serde(default)]
        audio: Option<PathBuf>,
    },
    /// Encoded video. Needs a decoder-backed [`SourceFactory`].
    Video { id: SourceId, path: PathBuf },
}

fn default_synthetic_width() -> u32 {
    320
}

fn default_synthetic_height() -> u32 {
    180
}

fn default_frame_rate() -> f64 {
    30.0
}

impl MediaDescriptor {
    pub fn id(&self) -> &SourceId {
        match self {
            MediaDescriptor::Synthetic { id, .. }
            | MediaDescriptor::ImageSequence { id, .. }
            | MediaDescriptor::Video { id, .. } => id,
        }
    }

    /// Files this descriptor refers to, resolved against `base_dir`.
    pub fn referenced_paths(&self, base_dir: &Path) -> Vec<PathBuf> {
        match self {
            MediaDescriptor::Synthetic { .. } => vec![],
            MediaDescriptor::ImageSequence { path, audio, .. } => std::iter::once(path)
                .chain(audio.as_ref())
                .map(|p| base_dir.join(p))
                .collect(),
            MediaDescriptor::Video { path, .. } => vec![base_dir.join(path)],
        }
    }
}

/// Opens media sources for documents.
pub trait SourceFactory {
    fn open(
        &self,
        descriptor: &MediaDescriptor,
        base_dir: &Path,
    ) -> LockstepResult<Box<dyn MediaSource>>;
}

/// Factory for the built-in sources. Video needs an external decoder and
/// is rejected.
#[derive(Debug, Clone)]
pub struct DefaultSourceFactory {
    clock: Arc<dyn WallClock>,
}

impl DefaultSourceFactory {
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        Self { clock }
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn open(
        &self,
        descriptor: &MediaDescriptor,
        base_dir: &Path,
    ) -> LockstepResult<Box<dyn MediaSource>> {
        match descriptor {
            MediaDescriptor::Synthetic {
                id,
                pattern,
                width,
                height,
                duration_secs,
                frame_rate,
            } => Ok(Box::new(
                SyntheticSource::new(id.clone(), *pattern, self.clock.clone())
                    .with_size(*width, *height)
                    .with_duration(*duration_secs)
                    .with_frame_rate(*frame_rate),
            )),
            MediaDescriptor::ImageSequence {
                id,
                path,
                frame_rate,
                audio,
            } => {
                let mut source = ImageSequenceSource::open(
                    id.clone(),
                    base_dir.join(path),
                    *frame_rate,
                    self.clock.clone(),
                )?;
                if let Some(audio) = audio {
                    source = source.with_audio(base_dir.join(audio));
                }
                Ok(Box::new(source))
            }
            MediaDescriptor::Video { id, path } => Err(LockstepError::asset_binding(format!(
                "source {id}: no video decoder available for {}",
                path.display()
            ))),
        }
    }
}

impl CompositionDocument {
    pub fn new(name: impl Into<String>, frame_rate: f64) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            name: name.into(),
            frame_rate,
            duration_override: None,
            master: None,
            layers: vec![],
        }
    }

    /// Load and validate a document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| DocumentError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let document: CompositionDocument =
            serde_json::from_str(&json).map_err(|e| DocumentError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
        document.validate()?;
        Ok(document)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DocumentError::IoError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| DocumentError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| DocumentError::IoError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Structural checks that do not need the sources to be opened.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let invalid = |message: String| Err(DocumentError::ValidationError { message });

        if self.version != DOCUMENT_VERSION {
            return invalid(format!(
                "unsupported document version {} (expected {DOCUMENT_VERSION})",
                self.version
            ));
        }
        if !(self.frame_rate > 0.0 && self.frame_rate.is_finite()) {
            return invalid(format!("frame rate must be positive, got {}", self.frame_rate));
        }
        if let Some(d) = self.duration_override {
            if !(d > 0.0 && d.is_finite()) {
                return invalid(format!("duration override must be positive, got {d}"));
            }
        }
        if self.layers.iter().filter(|l| l.params.is_main_track).count() > 1 {
            return invalid("more than one main track".to_string());
        }

        let mut layer_ids = BTreeSet::new();
        let mut source_ids = BTreeSet::new();
        for layer in &self.layers {
            if !layer_ids.insert(layer.id) {
                return invalid(format!("duplicate layer id {}", layer.id));
            }
            for descriptor in layer.media.iter().chain(layer.matte.iter()) {
                if !source_ids.insert(descriptor.id().clone()) {
                    return invalid(format!("source id {} is used twice", descriptor.id()));
                }
            }
        }

        if let Some(master) = self.master {
            match self.layers.iter().find(|l| l.id == master) {
                None => return invalid(format!("master {master} is not a layer")),
                Some(layer) if layer.media.is_none() => {
                    return invalid(format!("master {master} has no media"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Referenced files that do not exist.
    pub fn missing_files(&self, base_dir: &Path) -> Vec<PathBuf> {
        self.layers
            .iter()
            .flat_map(|l| l.media.iter().chain(l.matte.iter()))
            .flat_map(|d| d.referenced_paths(base_dir))
            .filter(|p| !p.exists())
            .collect()
    }

    /// Six-layer demo: a main track with a half-transparent matte over
    /// four corner-pinned composites that hand over at frames 68, 153
    /// and 209.
    pub fn sample() -> Self {
        fn pin(tl: (f64, f64), tr: (f64, f64), bl: (f64, f64), br: (f64, f64)) -> CornerPin {
            CornerPin {
                top_left: Point2D::new(tl.0, tl.1),
                top_right: Point2D::new(tr.0, tr.1),
                bottom_left: Point2D::new(bl.0, bl.1),
                bottom_right: Point2D::new(br.0, br.1),
            }
        }
        fn synthetic(id: &str, pattern: SyntheticPattern) -> MediaDescriptor {
            MediaDescriptor::Synthetic {
                id: SourceId::new(id),
                pattern,
                width: default_synthetic_width(),
                height: default_synthetic_height(),
                duration_secs: 8.0,
                frame_rate: 30.0,
            }
        }
        fn composite(
            id: u64,
            z_index: i32,
            start: u64,
            end: u64,
            corner_pin: CornerPin,
            media: MediaDescriptor,
        ) -> LayerDocument {
            LayerDocument {
                id: LayerId(id),
                params: LayerParams {
                    name: Some(format!("composite-{id}")),
                    corner_pin: Some(corner_pin),
                    ..LayerParams::composite(
                        z_index,
                        FrameRange::new(start, end).unwrap_or(FrameRange::UNBOUNDED),
                    )
                },
                media: Some(media),
                matte: None,
            }
        }

        let intro = pin((-72.0, 1164.0), (1920.0, -188.0), (-336.0, 2560.0), (1916.0, 1956.0));

        let main = LayerDocument {
            id: LayerId(1),
            params: LayerParams {
                z_index: 3,
                ..LayerParams::main_track()
            },
            media: Some(synthetic("main", SyntheticPattern::Gradient)),
            matte: Some(synthetic("main-matte", SyntheticPattern::Gray(128))),
        };

        Self {
            version: DOCUMENT_VERSION,
            name: "sample".to_string(),
            frame_rate: 30.0,
            duration_override: None,
            master: Some(LayerId(1)),
            layers: vec![
                main,
                composite(
                    2,
                    1,
                    0,
                    67,
                    intro,
                    synthetic("intro-a", SyntheticPattern::Solid([220, 60, 60, 255])),
                ),
                composite(
                    3,
                    2,
                    0,
                    67,
                    intro,
                    synthetic("intro-b", SyntheticPattern::FrameCounter),
                ),
                composite(
                    4,
                    1,
                    68,
                    152,
                    pin((96.0, 0.0), (3720.0, 8.0), (288.0, 2088.0), (3704.0, 1976.0)),
                    synthetic("middle", SyntheticPattern::Solid([60, 200, 90, 255])),
                ),
                composite(
                    5,
                    1,
                    153,
                    208,
                    pin((544.0, 64.0), (3824.0, 64.0), (544.0, 2216.0), (3824.0, 2192.0)),
                    synthetic("late", SyntheticPattern::Solid([60, 90, 220, 255])),
                ),
                composite(
                    6,
                    1,
                    209,
                    240,
                    CornerPin::full_frame(),
                    synthetic("outro", SyntheticPattern::Gray(200)),
                ),
            ],
        }
    }
}

/// Errors that can occur when loading or saving documents.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid composition document: {message}")]
    ValidationError { message: String },
}

impl From<DocumentError> for LockstepError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::IoError { path, source } if source.kind() == std::io::ErrorKind::NotFound => {
                LockstepError::FileNotFound { path }
            }
            other => LockstepError::composition(other.to_string()),
        }
    }
}

impl Composition {
    /// Build a composition from a document, opening every source through
    /// `factory`. Layer ids are preserved.
    pub async fn from_document(
        document: &CompositionDocument,
        factory: &dyn SourceFactory,
        base_dir: &Path,
        clock: Arc<dyn WallClock>,
    ) -> LockstepResult<Self> {
        document.validate()?;

        let mut composition = Composition::new(document.frame_rate, clock)?
            .with_name(document.name.clone());
        composition.set_duration_override(document.duration_override)?;

        for layer in &document.layers {
            composition.insert_layer(layer.id, layer.params.clone())?;
            if let Some(descriptor) = &layer.media {
                let source = factory.open(descriptor, base_dir)?;
                composition.bind_media(layer.id, source).await?;
                composition
                    .descriptors
                    .insert(descriptor.id().clone(), descriptor.clone());
            }
            if let Some(descriptor) = &layer.matte {
                let source = factory.open(descriptor, base_dir)?;
                composition.bind_matte(layer.id, source).await?;
                composition
                    .descriptors
                    .insert(descriptor.id().clone(), descriptor.clone());
            }
        }

        if let Some(master) = document.master {
            composition.set_master_layer(master)?;
        }

        tracing::info!(
            name = %document.name,
            layers = document.layers.len(),
            frame_rate = document.frame_rate,
            "Composition loaded"
        );
        Ok(composition)
    }

    /// Open `descriptor` and bind it as the layer's media, remembering the
    /// descriptor for [`Composition::to_document`].
    pub async fn bind_media_from(
        &mut self,
        id: LayerId,
        descriptor: MediaDescriptor,
        factory: &dyn SourceFactory,
        base_dir: &Path,
    ) -> LockstepResult<()> {
        let source = factory.open(&descriptor, base_dir)?;
        self.bind_media(id, source).await?;
        self.descriptors.insert(descriptor.id().clone(), descriptor);
        Ok(())
    }

    pub async fn bind_matte_from(
        &mut self,
        id: LayerId,
        descriptor: MediaDescriptor,
        factory: &dyn SourceFactory,
        base_dir: &Path,
    ) -> LockstepResult<()> {
        let source = factory.open(&descriptor, base_dir)?;
        self.bind_matte(id, source).await?;
        self.descriptors.insert(descriptor.id().clone(), descriptor);
        Ok(())
    }

    /// Snapshot the composition as a document. Sources bound without a
    /// descriptor are left out.
    pub fn to_document(&self) -> CompositionDocument {
        let describe = |slot: Option<&crate::media::SourceSlot>| {
            let slot = slot?;
            let descriptor = self.descriptors.get(slot.id()).cloned();
            if descriptor.is_none() {
                tracing::warn!(source = %slot.id(), "Source has no descriptor; not saved");
            }
            descriptor
        };

        CompositionDocument {
            version: DOCUMENT_VERSION,
            name: self.name().to_string(),
            frame_rate: self.frame_rate(),
            duration_override: self.duration_override(),
            master: self.master_layer(),
            layers: self
                .layers()
                .iter()
                .map(|layer| LayerDocument {
                    id: layer.id(),
                    params: layer.params(),
                    media: describe(layer.media()),
                    matte: describe(layer.matte()),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_common::ManualClock;

    fn clock() -> Arc<dyn WallClock> {
        Arc::new(ManualClock::new(0.0))
    }

    #[test]
    fn test_sample_is_valid() {
        let doc = CompositionDocument::sample();
        doc.validate().unwrap();
        assert_eq!(doc.layers.len(), 6);
        assert_eq!(doc.master, Some(LayerId(1)));
        assert!(doc.layers[0].params.is_main_track);
    }

    #[test]
    fn test_document_save_and_load() {
        let dir = std::env::temp_dir().join("lockstep-test-document");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("composition.json");

        let doc = CompositionDocument::sample();
        doc.save(&path).unwrap();
        let loaded = CompositionDocument::load(&path).unwrap();
        assert_eq!(loaded, doc);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = CompositionDocument::load("/nonexistent/lockstep/composition.json").unwrap_err();
        assert!(matches!(err, DocumentError::IoError { .. }));
        assert!(matches!(
            LockstepError::from(err),
            LockstepError::FileNotFound { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_sources() {
        let mut doc = CompositionDocument::sample();
        doc.layers[2].media = doc.layers[1].media.clone();
        assert!(matches!(
            doc.validate(),
            Err(DocumentError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_master_without_media() {
        let mut doc = CompositionDocument::sample();
        doc.layers[0].media = None;
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_inverted_frame_range_fails_to_parse() {
        let json = r#"{
            "version": 1, "name": "bad", "frame_rate": 30.0,
            "layers": [{ "id": 2, "params": { "frame_range": { "start": 50, "end": 10 } } }]
        }"#;
        assert!(serde_json::from_str::<CompositionDocument>(json).is_err());
    }

    #[test]
    fn test_video_descriptor_is_rejected_by_default_factory() {
        let factory = DefaultSourceFactory::new(clock());
        let descriptor = MediaDescriptor::Video {
            id: SourceId::new("clip"),
            path: PathBuf::from("clip.mp4"),
        };
        let err = factory.open(&descriptor, Path::new(".")).err().unwrap();
        assert!(matches!(err, LockstepError::AssetBinding { .. }));
    }

    #[tokio::test]
    async fn test_from_document_preserves_ids_and_master() {
        let doc = CompositionDocument::sample();
        let factory = DefaultSourceFactory::new(clock());
        let composition = Composition::from_document(&doc, &factory, Path::new("."), clock())
            .await
            .unwrap();

        assert_eq!(composition.layers().len(), 6);
        assert_eq!(composition.master_layer(), Some(LayerId(1)));
        assert!((composition.duration() - 8.0).abs() < 1e-9);
        assert_eq!(composition.to_document(), doc);
    }
}
