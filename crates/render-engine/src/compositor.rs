//! Layered compositor.
//!
//! Draws the active layers of a composition back to front into one
//! framebuffer. Each layer is a textured quad placed by its transform
//! matrix, sampled through its corner pin, and optionally keyed by a
//! luminance matte. Layers that cannot be drawn this frame are skipped
//! and listed in the [`RenderReport`]; only backend failures are errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::RgbaImage;

use lockstep_common::{BackendKind, CompositorConfig, LayerId, LockstepError, LockstepResult};
use lockstep_composition::{Composition, CompositionTime, Layer, SourceSlot};

use crate::backend::{DrawCall, RenderBackend};
use crate::raster::SoftwareBackend;
use crate::texture::{TextureRole, TextureSlot, TextureSlots};
use crate::uniforms::LayerUniforms;

/// Minimum texture units: one layer with a matte.
pub const MIN_TEXTURE_UNITS: u32 = 2;

/// Why a layer was not drawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Outside its frame range at the render time.
    OutOfRange,
    NoMedia,
    NotReady,
    SourceError(String),
    /// Ready but no decoded frame available.
    NoFrame,
    TextureUnitsExhausted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::OutOfRange => f.write_str("outside frame range"),
            SkipReason::NoMedia => f.write_str("no media bound"),
            SkipReason::NotReady => f.write_str("media not ready"),
            SkipReason::SourceError(e) => write!(f, "source error: {e}"),
            SkipReason::NoFrame => f.write_str("no decoded frame"),
            SkipReason::TextureUnitsExhausted => f.write_str("texture units exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedLayer {
    pub layer_id: LayerId,
    pub reason: SkipReason,
}

/// Outcome of one [`Compositor::render`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderReport {
    pub time: CompositionTime,
    /// Layers drawn, in paint order.
    pub drawn: Vec<LayerId>,
    pub skipped: Vec<SkippedLayer>,
}

impl RenderReport {
    pub fn skip_reason(&self, layer_id: LayerId) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| s.layer_id == layer_id)
            .map(|s| &s.reason)
    }
}

/// Owns the framebuffer and every layer texture.
pub struct Compositor {
    backend: Box<dyn RenderBackend>,
    slots: TextureSlots,
    luma_weights: [f32; 3],
    clear_color: [f32; 4],
    /// Frame last uploaded to each slot, to skip redundant uploads.
    uploaded: BTreeMap<TextureSlot, Arc<RgbaImage>>,
}

impl std::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("backend", &self.backend.name())
            .field("size", &self.backend.size())
            .field("slots", &self.slots)
            .finish()
    }
}

impl Compositor {
    /// Wrap a backend. Fails on invalid luma weights or too few texture units.
    pub fn new(backend: Box<dyn RenderBackend>, config: &CompositorConfig) -> LockstepResult<Self> {
        if !config.luma_weights.is_valid() {
            return Err(LockstepError::compositor_init(format!(
                "invalid luma weights {:?}",
                config.luma_weights.coefficients()
            )));
        }
        if config.max_texture_units < MIN_TEXTURE_UNITS {
            return Err(LockstepError::compositor_init(format!(
                "at least {MIN_TEXTURE_UNITS} texture units are required, got {}",
                config.max_texture_units
            )));
        }
        if !config.clear_color.iter().all(|c| c.is_finite()) {
            return Err(LockstepError::compositor_init("clear colour must be finite"));
        }

        let (width, height) = backend.size();
        tracing::info!(
            backend = backend.name(),
            width,
            height,
            texture_units = config.max_texture_units,
            "Compositor created"
        );

        Ok(Self {
            backend,
            slots: TextureSlots::new(config.max_texture_units),
            luma_weights: config.luma_weights.coefficients(),
            clear_color: config.clear_color,
            uploaded: BTreeMap::new(),
        })
    }

    /// Compositor on the CPU rasterizer.
    pub fn software(config: &CompositorConfig) -> LockstepResult<Self> {
        let backend = SoftwareBackend::new(config.width, config.height)?;
        Self::new(Box::new(backend), config)
    }

    /// Compositor on the backend `config` selects.
    pub fn from_config(config: &CompositorConfig) -> LockstepResult<Self> {
        match config.backend {
            BackendKind::Software => Self::software(config),
            #[cfg(feature = "gpu")]
            BackendKind::Gpu => {
                let backend = crate::gpu::WgpuBackend::new(config.width, config.height)?;
                Self::new(Box::new(backend), config)
            }
            #[cfg(not(feature = "gpu"))]
            BackendKind::Gpu => Err(LockstepError::compositor_init(
                "GPU backend requested but lockstep was built without the `gpu` feature",
            )),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn size(&self) -> (u32, u32) {
        self.backend.size()
    }

    pub fn resize(&mut self, width: u32, height: u32) -> LockstepResult<()> {
        if self.backend.size() == (width, height) {
            return Ok(());
        }
        tracing::debug!(width, height, "Resizing compositor framebuffer");
        self.backend.resize(width, height)
    }

    pub fn texture_slots(&self) -> &TextureSlots {
        &self.slots
    }

    /// Free every texture held by `layer_id`.
    pub fn release_layer(&mut self, layer_id: LayerId) {
        for slot in self.slots.release_layer(layer_id) {
            self.uploaded.remove(&slot);
            self.backend.release(slot);
        }
    }

    fn release_role(&mut self, layer_id: LayerId, role: TextureRole) {
        if let Some(slot) = self.slots.release(layer_id, role) {
            self.uploaded.remove(&slot);
            self.backend.release(slot);
        }
    }

    /// Upload `frame` into `slot` unless it is already there.
    fn bind_frame(&mut self, slot: TextureSlot, frame: Arc<RgbaImage>) -> LockstepResult<()> {
        if let Some(current) = self.uploaded.get(&slot) {
            if Arc::ptr_eq(current, &frame) {
                return Ok(());
            }
        }
        self.backend.upload(slot, &frame)?;
        self.uploaded.insert(slot, frame);
        Ok(())
    }

    /// Frame of a usable matte, or `None` to draw the layer unkeyed.
    fn matte_frame(layer: &Layer) -> Option<Arc<RgbaImage>> {
        let matte = layer.matte()?;
        if !matte.is_usable() {
            tracing::debug!(layer = %layer.id(), source = %matte.id(), "Matte not ready, drawing unkeyed");
            return None;
        }
        matte.source().current_frame()
    }

    fn media_frame(layer: &Layer, time: CompositionTime) -> Result<Arc<RgbaImage>, SkipReason> {
        if !layer.is_main_track() {
            let in_range = time
                .frame()
                .is_some_and(|frame| layer.frame_range().contains(frame));
            if !in_range {
                return Err(SkipReason::OutOfRange);
            }
        }
        let media: &SourceSlot = layer.media().ok_or(SkipReason::NoMedia)?;
        if let Some(error) = media.source().error() {
            return Err(SkipReason::SourceError(error));
        }
        if !media.source().is_ready() {
            return Err(SkipReason::NotReady);
        }
        media.source().current_frame().ok_or(SkipReason::NoFrame)
    }

    /// Draw one layer. `Ok(Err(reason))` means the layer was skipped.
    fn draw_layer(
        &mut self,
        layer: &Layer,
        time: CompositionTime,
    ) -> LockstepResult<Result<(), SkipReason>> {
        let frame = match Self::media_frame(layer, time) {
            Ok(frame) => frame,
            Err(reason) => return Ok(Err(reason)),
        };
        let Some(color) = self.slots.acquire(layer.id(), TextureRole::Color) else {
            return Ok(Err(SkipReason::TextureUnitsExhausted));
        };
        if let Err(e) = self.bind_frame(color, frame) {
            return Ok(Err(SkipReason::SourceError(e.to_string())));
        }

        let matte = match Self::matte_frame(layer) {
            Some(frame) => {
                let Some(slot) = self.slots.acquire(layer.id(), TextureRole::Matte) else {
                    return Ok(Err(SkipReason::TextureUnitsExhausted));
                };
                if let Err(e) = self.bind_frame(slot, frame) {
                    return Ok(Err(SkipReason::SourceError(e.to_string())));
                }
                Some(slot)
            }
            None => {
                if layer.matte().is_none() {
                    self.release_role(layer.id(), TextureRole::Matte);
                }
                None
            }
        };

        let uniforms = LayerUniforms::for_layer(layer, self.luma_weights);
        self.backend.draw(&DrawCall {
            color,
            matte,
            uniforms: &uniforms,
        })?;
        Ok(Ok(()))
    }

    /// Clear the framebuffer and draw `layers` in the given order, which
    /// must be ascending z.
    pub fn render(&mut self, layers: &[&Layer], time: CompositionTime) -> LockstepResult<RenderReport> {
        self.backend.clear(self.clear_color);

        let mut report = RenderReport {
            time,
            drawn: Vec::with_capacity(layers.len()),
            skipped: Vec::new(),
        };
        for layer in layers {
            match self.draw_layer(layer, time)? {
                Ok(()) => report.drawn.push(layer.id()),
                Err(reason) => {
                    match &reason {
                        SkipReason::TextureUnitsExhausted | SkipReason::SourceError(_) => {
                            tracing::warn!(layer = %layer.id(), reason = %reason, "Skipping layer");
                        }
                        _ => {
                            tracing::trace!(layer = %layer.id(), reason = %reason, "Skipping layer");
                        }
                    }
                    report.skipped.push(SkippedLayer {
                        layer_id: layer.id(),
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Render the layers of `composition` active at `secs`. Textures of
    /// layers no longer in the composition are released first.
    pub fn render_composition(
        &mut self,
        composition: &Composition,
        secs: f64,
    ) -> LockstepResult<RenderReport> {
        for layer_id in self.slots.layers() {
            if composition.layer(layer_id).is_none() {
                self.release_layer(layer_id);
            }
        }
        let layers = composition.active_layers(secs);
        self.render(&layers, composition.time_at(secs))
    }

    /// Framebuffer contents as straight-alpha RGBA.
    pub fn capture(&mut self) -> LockstepResult<RgbaImage> {
        self.backend.read_pixels()
    }
}
