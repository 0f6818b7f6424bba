//! The seam between the compositor and a rasterizer.

use image::RgbaImage;

use lockstep_common::LockstepResult;

use crate::texture::TextureSlot;
use crate::uniforms::LayerUniforms;

/// One layer draw: the unit quad through the layer matrix, sampling
/// `color` (and `matte`, when present) at the corner-pinned coordinate.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub color: TextureSlot,
    pub matte: Option<TextureSlot>,
    pub uniforms: &'a LayerUniforms,
}

/// A rasterizer with premultiplied `ONE, ONE_MINUS_SRC_ALPHA` blending
/// into a single framebuffer.
pub trait RenderBackend: Send {
    /// Backend name.
    fn name(&self) -> &str;

    fn size(&self) -> (u32, u32);

    /// Reallocate the framebuffer. Contents are undefined until `clear`.
    fn resize(&mut self, width: u32, height: u32) -> LockstepResult<()>;

    /// Fill the framebuffer with a straight-alpha colour.
    fn clear(&mut self, color: [f32; 4]);

    /// Replace the contents of a texture slot.
    fn upload(&mut self, slot: TextureSlot, image: &RgbaImage) -> LockstepResult<()>;

    fn draw(&mut self, call: &DrawCall<'_>) -> LockstepResult<()>;

    /// Framebuffer contents, un-premultiplied.
    fn read_pixels(&mut self) -> LockstepResult<RgbaImage>;

    /// Drop a slot's texture.
    fn release(&mut self, slot: TextureSlot);
}
