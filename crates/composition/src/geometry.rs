//! Canvas geometry: canonical space, points, and layer matrices.

use serde::{Deserialize, Serialize};

/// Width of the canonical canvas corner pins are authored in.
pub const CANONICAL_WIDTH: f64 = 3840.0;

/// Height of the canonical canvas corner pins are authored in.
pub const CANONICAL_HEIGHT: f64 = 2160.0;

/// A 2D point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &Point2D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Linear interpolation between two points.
    pub fn lerp(a: &Point2D, b: &Point2D, t: f64) -> Point2D {
        let t = t.clamp(0.0, 1.0);
        Point2D {
            x: a.x + (b.x - a.x) * t,
            y: a.y + (b.y - a.y) * t,
        }
    }

    /// Map a canonical-space point to `[0, 1]` texture space.
    pub fn normalized(&self) -> [f32; 2] {
        [
            (self.x / CANONICAL_WIDTH) as f32,
            (self.y / CANONICAL_HEIGHT) as f32,
        ]
    }
}

/// A 4×4 matrix stored column by column, the layout shaders consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat4 {
    pub cols: [[f32; 4]; 4],
}

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4 {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Apply to a point on the z = 0 plane.
    pub fn transform_point(&self, x: f32, y: f32) -> [f32; 2] {
        let c = &self.cols;
        [
            c[0][0] * x + c[1][0] * y + c[3][0],
            c[0][1] * x + c[1][1] * y + c[3][1],
        ]
    }

    /// Invert the 2D affine part, returning `None` for a degenerate matrix.
    pub fn inverse_affine(&self) -> Option<AffineInverse> {
        let c = &self.cols;
        let (a, b) = (c[0][0], c[0][1]);
        let (cx, d) = (c[1][0], c[1][1]);
        let det = a * d - cx * b;
        if det.abs() < f32::EPSILON || !det.is_finite() {
            return None;
        }
        Some(AffineInverse {
            m: [d / det, -b / det, -cx / det, a / det],
            tx: c[3][0],
            ty: c[3][1],
        })
    }

    /// Flat column-major array.
    pub fn to_cols_array(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (i, col) in self.cols.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(col);
        }
        out
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Inverse of the 2D affine part of a [`Mat4`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineInverse {
    m: [f32; 4],
    tx: f32,
    ty: f32,
}

impl AffineInverse {
    /// Map a transformed point back into the untransformed plane.
    pub fn apply(&self, x: f32, y: f32) -> [f32; 2] {
        let (px, py) = (x - self.tx, y - self.ty);
        [
            self.m[0] * px + self.m[2] * py,
            self.m[1] * px + self.m[3] * py,
        ]
    }
}
