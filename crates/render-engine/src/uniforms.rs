//! Per-layer shader inputs and the math both backends share.
//!
//! The software rasterizer calls these functions per pixel; the WGSL shader
//! in `gpu` mirrors them line for line.

use lockstep_composition::{Layer, MatteSettings};

/// Exponent applied to matte luminance when gamma correction is on.
pub const MATTE_GAMMA: f32 = 1.0 / 2.2;

/// `a + (b − a)·t`. This form returns `a` and `b` exactly at `t = 0` and
/// `t = 1`, which keeps the identity corner pin bit-exact.
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Texture coordinate for quad position `(x, y)` in `[0, 1]²` (y down),
/// remapped through a normalized TL, TR, BL, BR quad.
#[inline]
pub fn corner_pin_uv(quad: &[[f32; 2]; 4], x: f32, y: f32) -> [f32; 2] {
    let [tl, tr, bl, br] = quad;
    let top = [lerp(tl[0], tr[0], x), lerp(tl[1], tr[1], x)];
    let bottom = [lerp(bl[0], br[0], x), lerp(bl[1], br[1], x)];
    [lerp(top[0], bottom[0], y), lerp(top[1], bottom[1], y)]
}

/// Map a point of the untransformed clip-space quad `[-1, 1]²` (y up) to
/// quad coordinates in `[0, 1]²` (y down).
#[inline]
pub fn quad_coords(local_x: f32, local_y: f32) -> [f32; 2] {
    [local_x * 0.5 + 0.5, 0.5 - local_y * 0.5]
}

#[inline]
pub fn luminance(rgb: [f32; 3], weights: [f32; 3]) -> f32 {
    rgb[0] * weights[0] + rgb[1] * weights[1] + rgb[2] * weights[2]
}

/// Matte luminance with optional gamma and inversion, clamped to `[0, 1]`.
/// Gamma is applied before inversion.
pub fn matte_alpha(rgb: [f32; 3], weights: [f32; 3], settings: MatteSettings) -> f32 {
    let mut y = luminance(rgb, weights).clamp(0.0, 1.0);
    if settings.gamma_correct {
        y = y.powf(MATTE_GAMMA);
    }
    if settings.invert {
        y = 1.0 - y;
    }
    y.clamp(0.0, 1.0)
}

/// Everything a draw needs to know about one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerUniforms {
    /// Column-major layer matrix.
    pub matrix: [f32; 16],
    /// Normalized TL, TR, BL, BR, or `None` for the plain quad.
    pub corner_pin: Option<[[f32; 2]; 4]>,
    pub matte: MatteSettings,
    pub luma_weights: [f32; 3],
    /// Carried to the shader; not used by the current math.
    pub distort: f32,
}

impl LayerUniforms {
    pub fn for_layer(layer: &Layer, luma_weights: [f32; 3]) -> Self {
        Self {
            matrix: layer.transform.matrix().to_cols_array(),
            corner_pin: layer.corner_pin.map(|pin| pin.normalized()),
            matte: layer.matte_settings,
            luma_weights,
            distort: layer.transform.distort as f32,
        }
    }

    /// Texture coordinate for quad position `(x, y)`.
    #[inline]
    pub fn uv(&self, x: f32, y: f32) -> [f32; 2] {
        match &self.corner_pin {
            Some(quad) => corner_pin_uv(quad, x, y),
            None => [x, y],
        }
    }
}
