//! CPU rasterizer. Runs the layer vertex and fragment math per pixel.
//!
//! Deterministic and always available; the compositor tests run on it.

use std::collections::BTreeMap;

use image::{Rgba, RgbaImage};

use lockstep_common::{LockstepError, LockstepResult};
use lockstep_composition::Mat4;

use crate::backend::{DrawCall, RenderBackend};
use crate::texture::TextureSlot;
use crate::uniforms::{matte_alpha, quad_coords};

/// Premultiplied RGBA, 0..1.
type Pixel = [f32; 4];

#[derive(Debug)]
pub struct SoftwareBackend {
    width: u32,
    height: u32,
    framebuffer: Vec<Pixel>,
    textures: BTreeMap<TextureSlot, RgbaImage>,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32) -> LockstepResult<Self> {
        let mut backend = Self {
            width: 0,
            height: 0,
            framebuffer: Vec::new(),
            textures: BTreeMap::new(),
        };
        backend.resize(width, height)?;
        Ok(backend)
    }

    fn texture(&self, slot: TextureSlot) -> LockstepResult<&RgbaImage> {
        self.textures.get(&slot).ok_or_else(|| {
            LockstepError::compositor_init(format!("texture slot {} was never uploaded", slot.0))
        })
    }
}

/// Bilinear, clamp-to-edge sample at `uv` (texel centers at `(i + 0.5) / n`).
/// Returns straight-alpha RGBA in 0..1.
fn sample_bilinear(texture: &RgbaImage, uv: [f32; 2]) -> [f32; 4] {
    let (w, h) = texture.dimensions();
    let fx = uv[0].clamp(0.0, 1.0) * w as f32 - 0.5;
    let fy = uv[1].clamp(0.0, 1.0) * h as f32 - 0.5;

    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = fx - x0;
    let ty = fy - y0;

    let clamp_x = |x: f32| (x.max(0.0) as u32).min(w - 1);
    let clamp_y = |y: f32| (y.max(0.0) as u32).min(h - 1);
    let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
    let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

    let texel = |x: u32, y: u32| texture.get_pixel(x, y).0;
    let (p00, p10, p01, p11) = (texel(xa, ya), texel(xb, ya), texel(xa, yb), texel(xb, yb));

    let mut out = [0.0; 4];
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] as f32 + (p10[c] as f32 - p00[c] as f32) * tx;
        let bottom = p01[c] as f32 + (p11[c] as f32 - p01[c] as f32) * tx;
        *value = (top + (bottom - top) * ty) / 255.0;
    }
    out
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

impl RenderBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> LockstepResult<()> {
        if width == 0 || height == 0 {
            return Err(LockstepError::compositor_init(format!(
                "framebuffer size must be non-zero, got {width}x{height}"
            )));
        }
        self.width = width;
        self.height = height;
        self.framebuffer = vec![[0.0; 4]; width as usize * height as usize];
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) {
        let a = color[3].clamp(0.0, 1.0);
        let premultiplied = [color[0] * a, color[1] * a, color[2] * a, a];
        self.framebuffer.fill(premultiplied);
    }

    fn upload(&mut self, slot: TextureSlot, image: &RgbaImage) -> LockstepResult<()> {
        if image.width() == 0 || image.height() == 0 {
            return Err(LockstepError::media("cannot upload an empty frame"));
        }
        self.textures.insert(slot, image.clone());
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> LockstepResult<()> {
        let uniforms = call.uniforms;
        let matrix = Mat4 {
            cols: [
                [uniforms.matrix[0], uniforms.matrix[1], uniforms.matrix[2], uniforms.matrix[3]],
                [uniforms.matrix[4], uniforms.matrix[5], uniforms.matrix[6], uniforms.matrix[7]],
                [uniforms.matrix[8], uniforms.matrix[9], uniforms.matrix[10], uniforms.matrix[11]],
                [uniforms.matrix[12], uniforms.matrix[13], uniforms.matrix[14], uniforms.matrix[15]],
            ],
        };
        let Some(inverse) = matrix.inverse_affine() else {
            // Degenerate transform covers no pixels.
            return Ok(());
        };

        let color = self.texture(call.color)?;
        let matte = match call.matte {
            Some(slot) => Some(self.texture(slot)?),
            None => None,
        };

        let (width, height) = (self.width as f32, self.height as f32);
        let mut blended = Vec::with_capacity(self.framebuffer.len());
        for py in 0..self.height {
            let clip_y = 1.0 - (py as f32 + 0.5) / height * 2.0;
            for px in 0..self.width {
                let clip_x = (px as f32 + 0.5) / width * 2.0 - 1.0;
                let [lx, ly] = inverse.apply(clip_x, clip_y);
                if !(-1.0..=1.0).contains(&lx) || !(-1.0..=1.0).contains(&ly) {
                    continue;
                }
                let [x, y] = quad_coords(lx, ly);
                let uv = uniforms.uv(x, y);

                let src = sample_bilinear(color, uv);
                let alpha = match matte {
                    Some(matte) => {
                        let m = sample_bilinear(matte, uv);
                        matte_alpha([m[0], m[1], m[2]], uniforms.luma_weights, uniforms.matte)
                            * src[3]
                    }
                    None => src[3],
                };
                blended.push((
                    (py * self.width + px) as usize,
                    [src[0] * alpha, src[1] * alpha, src[2] * alpha, alpha],
                ));
            }
        }

        for (index, src) in blended {
            let dst = &mut self.framebuffer[index];
            let keep = 1.0 - src[3];
            for c in 0..4 {
                dst[c] = src[c] + dst[c] * keep;
            }
        }
        Ok(())
    }

    fn read_pixels(&mut self) -> LockstepResult<RgbaImage> {
        let mut image = RgbaImage::new(self.width, self.height);
        for (pixel, src) in image.pixels_mut().zip(&self.framebuffer) {
            let a = src[3];
            *pixel = if a <= 0.0 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([to_u8(src[0] / a), to_u8(src[1] / a), to_u8(src[2] / a), to_u8(a)])
            };
        }
        Ok(image)
    }

    fn release(&mut self, slot: TextureSlot) {
        self.textures.remove(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniforms::LayerUniforms;
    use lockstep_composition::{MatteSettings, Transform};

    fn uniforms(transform: Transform) -> LayerUniforms {
        LayerUniforms {
            matrix: transform.matrix().to_cols_array(),
            corner_pin: None,
            matte: MatteSettings::default(),
            luma_weights: [0.2126, 0.7152, 0.0722],
            distort: 0.0,
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            SoftwareBackend::new(0, 10),
            Err(LockstepError::CompositorInit { .. })
        ));
    }

    #[test]
    fn test_identity_draw_copies_texture() {
        let mut backend = SoftwareBackend::new(8, 4).unwrap();
        let mut texture = RgbaImage::new(8, 4);
        for (x, y, p) in texture.enumerate_pixels_mut() {
            *p = Rgba([(x * 30) as u8, (y * 60) as u8, 7, 255]);
        }
        backend.upload(TextureSlot(0), &texture).unwrap();
        backend.clear([0.0; 4]);
        let u = uniforms(Transform::IDENTITY);
        backend
            .draw(&DrawCall {
                color: TextureSlot(0),
                matte: None,
                uniforms: &u,
            })
            .unwrap();

        assert_eq!(backend.read_pixels().unwrap(), texture);
    }

    #[test]
    fn test_scaled_layer_leaves_border_clear() {
        let mut backend = SoftwareBackend::new(10, 10).unwrap();
        backend
            .upload(TextureSlot(0), &RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255])))
            .unwrap();
        backend.clear([0.0; 4]);
        let u = uniforms(Transform {
            scale: 0.5,
            ..Transform::IDENTITY
        });
        backend
            .draw(&DrawCall {
                color: TextureSlot(0),
                matte: None,
                uniforms: &u,
            })
            .unwrap();

        let out = backend.read_pixels().unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(out.get_pixel(5, 5).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_premultiplied_over_blend() {
        let mut backend = SoftwareBackend::new(2, 2).unwrap();
        backend
            .upload(TextureSlot(0), &RgbaImage::from_pixel(1, 1, Rgba([0, 0, 255, 255])))
            .unwrap();
        backend
            .upload(TextureSlot(1), &RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 128])))
            .unwrap();
        backend.clear([0.0; 4]);
        let u = uniforms(Transform::IDENTITY);
        for slot in [TextureSlot(0), TextureSlot(1)] {
            backend
                .draw(&DrawCall {
                    color: slot,
                    matte: None,
                    uniforms: &u,
                })
                .unwrap();
        }

        let [r, g, b, a] = backend.read_pixels().unwrap().get_pixel(0, 0).0;
        assert_eq!(a, 255);
        assert_eq!(g, 0);
        assert!((r as i32 - 128).abs() <= 1, "r = {r}");
        assert!((b as i32 - 127).abs() <= 1, "b = {b}");
    }

    #[test]
    fn test_degenerate_matrix_draws_nothing() {
        let mut backend = SoftwareBackend::new(4, 4).unwrap();
        backend
            .upload(TextureSlot(0), &RgbaImage::from_pixel(1, 1, Rgba([255; 4])))
            .unwrap();
        backend.clear([0.0; 4]);
        let u = uniforms(Transform {
            scale: 0.0,
            ..Transform::IDENTITY
        });
        backend
            .draw(&DrawCall {
                color: TextureSlot(0),
                matte: None,
                uniforms: &u,
            })
            .unwrap();
        assert!(backend.read_pixels().unwrap().pixels().all(|p| p.0[3] == 0));
    }
}
