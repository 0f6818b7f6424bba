//! Layers: what is drawn, where, when, and in which order.

use serde::{Deserialize, Serialize};

use lockstep_common::{LayerId, LockstepError, LockstepResult};

use crate::geometry::{Mat4, Point2D, CANONICAL_HEIGHT, CANONICAL_WIDTH};
use crate::media::SourceSlot;
use crate::time::CompositionTime;

/// Inclusive range of frames a layer is visible for.
///
/// `start <= end` always holds; construction rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFrameRange", into = "RawFrameRange")]
pub struct FrameRange {
    start: u64,
    end: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawFrameRange {
    start: u64,
    end: u64,
}

impl TryFrom<RawFrameRange> for FrameRange {
    type Error = LockstepError;

    fn try_from(raw: RawFrameRange) -> Result<Self, Self::Error> {
        FrameRange::new(raw.start, raw.end)
    }
}

impl From<FrameRange> for RawFrameRange {
    fn from(range: FrameRange) -> Self {
        RawFrameRange {
            start: range.start,
            end: range.end,
        }
    }
}

impl FrameRange {
    /// Every frame from zero on.
    pub const UNBOUNDED: FrameRange = FrameRange {
        start: 0,
        end: u64::MAX,
    };

    pub fn new(start: u64, end: u64) -> LockstepResult<Self> {
        if start > end {
            return Err(LockstepError::InvalidFrameRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, frame: u64) -> bool {
        frame >= self.start && frame <= self.end
    }

    /// Number of frames covered.
    pub fn frame_count(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }
}

impl Default for FrameRange {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

/// Per-layer transform as set from the editing controls.
///
/// Angles are in degrees. `distort` is forwarded to the shader but does not
/// enter the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub scale: f64,
    pub rotate_degrees: f64,
    pub distort: f64,
    pub skew_x_degrees: f64,
    pub skew_y_degrees: f64,
    /// Horizontal offset in clip units (-1..1 spans the frame).
    pub pos_x: f64,
    /// Vertical offset in clip units, positive up.
    pub pos_y: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        scale: 1.0,
        rotate_degrees: 0.0,
        distort: 0.0,
        skew_x_degrees: 0.0,
        skew_y_degrees: 0.0,
        pos_x: 0.0,
        pos_y: 0.0,
    };

    /// Layer matrix, column by column:
    ///
    /// ```text
    /// [ s·cosθ,  −sinθ + tan(skewX), 0, 0 ]
    /// [ sinθ + tan(skewY),  s·cosθ,  0, 0 ]
    /// [ 0,       0,                  1, 0 ]
    /// [ posX,    posY,               0, 1 ]
    /// ```
    ///
    /// Deliberately non-orthogonal: skew adds to the rotation terms.
    pub fn matrix(&self) -> Mat4 {
        let rotate = self.rotate_degrees.to_radians();
        let skew_x = self.skew_x_degrees.to_radians();
        let skew_y = self.skew_y_degrees.to_radians();
        let (sin, cos) = rotate.sin_cos();
        let s = self.scale;

        Mat4 {
            cols: [
                [(s * cos) as f32, (-sin + skew_x.tan()) as f32, 0.0, 0.0],
                [(sin + skew_y.tan()) as f32, (s * cos) as f32, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [self.pos_x as f32, self.pos_y as f32, 0.0, 1.0],
            ],
        }
    }
}

/// Four-point quad in canonical canvas space that remaps a layer's
/// texture coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerPin {
    pub top_left: Point2D,
    pub top_right: Point2D,
    pub bottom_left: Point2D,
    pub bottom_right: Point2D,
}

impl CornerPin {
    /// The quad covering the whole canvas; remaps nothing.
    pub const fn full_frame() -> Self {
        Self {
            top_left: Point2D::new(0.0, 0.0),
            top_right: Point2D::new(CANONICAL_WIDTH, 0.0),
            bottom_left: Point2D::new(0.0, CANONICAL_HEIGHT),
            bottom_right: Point2D::new(CANONICAL_WIDTH, CANONICAL_HEIGHT),
        }
    }

    /// A rectangle of `scale` times the canvas, centered.
    pub fn centered(scale: f64) -> Self {
        let half_w = CANONICAL_WIDTH * scale / 2.0;
        let half_h = CANONICAL_HEIGHT * scale / 2.0;
        let (cx, cy) = (CANONICAL_WIDTH / 2.0, CANONICAL_HEIGHT / 2.0);
        Self {
            top_left: Point2D::new(cx - half_w, cy - half_h),
            top_right: Point2D::new(cx + half_w, cy - half_h),
            bottom_left: Point2D::new(cx - half_w, cy + half_h),
            bottom_right: Point2D::new(cx + half_w, cy + half_h),
        }
    }

    /// Corners in `[0, 1]` texture space, ordered TL, TR, BL, BR.
    pub fn normalized(&self) -> [[f32; 2]; 4] {
        [
            self.top_left.normalized(),
            self.top_right.normalized(),
            self.bottom_left.normalized(),
            self.bottom_right.normalized(),
        ]
    }

    pub fn is_full_frame(&self) -> bool {
        *self == Self::full_frame()
    }
}

impl Default for CornerPin {
    fn default() -> Self {
        Self::full_frame()
    }
}

/// How a layer's matte is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatteSettings {
    /// Use `1 − Y` instead of `Y`.
    pub invert: bool,
    /// Apply `Y^(1/2.2)` before inversion.
    pub gamma_correct: bool,
}

/// Editable layer properties, as supplied by an editing surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParams {
    pub name: Option<String>,
    pub z_index: i32,
    pub is_main_track: bool,
    pub frame_range: FrameRange,
    pub transform: Transform,
    pub corner_pin: Option<CornerPin>,
    pub matte: MatteSettings,
    /// Composition time at which the layer's media starts.
    pub source_offset_secs: f64,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self {
            name: None,
            z_index: 0,
            is_main_track: false,
            frame_range: FrameRange::UNBOUNDED,
            transform: Transform::IDENTITY,
            corner_pin: None,
            matte: MatteSettings::default(),
            source_offset_secs: 0.0,
        }
    }
}

impl LayerParams {
    pub fn main_track() -> Self {
        Self {
            name: Some("main".to_string()),
            is_main_track: true,
            ..Self::default()
        }
    }

    pub fn composite(z_index: i32, frame_range: FrameRange) -> Self {
        Self {
            z_index,
            frame_range,
            ..Self::default()
        }
    }
}

/// A layer of the composition. Owns its media and matte sources.
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    pub name: String,
    pub z_index: i32,
    is_main_track: bool,
    frame_range: FrameRange,
    pub transform: Transform,
    pub corner_pin: Option<CornerPin>,
    pub matte_settings: MatteSettings,
    source_offset_secs: f64,
    pub(crate) media: Option<SourceSlot>,
    pub(crate) matte: Option<SourceSlot>,
}

impl Layer {
    pub(crate) fn new(id: LayerId, params: LayerParams) -> Self {
        Self {
            id,
            name: params.name.unwrap_or_else(|| id.to_string()),
            z_index: params.z_index,
            is_main_track: params.is_main_track,
            frame_range: params.frame_range,
            transform: params.transform,
            corner_pin: params.corner_pin,
            matte_settings: params.matte,
            source_offset_secs: params.source_offset_secs.max(0.0),
            media: None,
            matte: None,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn is_main_track(&self) -> bool {
        self.is_main_track
    }

    pub fn frame_range(&self) -> FrameRange {
        self.frame_range
    }

    pub(crate) fn set_frame_range(&mut self, range: FrameRange) {
        self.frame_range = range;
    }

    pub fn source_offset_secs(&self) -> f64 {
        self.source_offset_secs
    }

    pub fn set_source_offset_secs(&mut self, offset: f64) {
        self.source_offset_secs = offset.max(0.0);
    }

    pub fn media(&self) -> Option<&SourceSlot> {
        self.media.as_ref()
    }

    pub fn media_mut(&mut self) -> Option<&mut SourceSlot> {
        self.media.as_mut()
    }

    pub fn matte(&self) -> Option<&SourceSlot> {
        self.matte.as_ref()
    }

    pub fn matte_mut(&mut self) -> Option<&mut SourceSlot> {
        self.matte.as_mut()
    }

    /// Whether the layer is drawn at `at`. The main track spans the whole
    /// composition; other layers follow their frame range.
    pub fn is_active(&self, at: CompositionTime, duration_secs: f64) -> bool {
        if self.is_main_track {
            return at.seconds >= 0.0 && at.seconds <= duration_secs;
        }
        at.frame().is_some_and(|frame| self.frame_range.contains(frame))
    }

    /// Media time this layer should show at composition time `secs`.
    pub fn media_time_at(&self, secs: f64) -> f64 {
        (secs - self.source_offset_secs).max(0.0)
    }

    /// Composition time corresponding to media time `secs`.
    pub fn composition_time_of(&self, media_secs: f64) -> f64 {
        media_secs + self.source_offset_secs
    }

    /// Layer properties without the bound sources.
    pub fn params(&self) -> LayerParams {
        LayerParams {
            name: Some(self.name.clone()),
            z_index: self.z_index,
            is_main_track: self.is_main_track,
            frame_range: self.frame_range,
            transform: self.transform,
            corner_pin: self.corner_pin,
            matte: self.matte_settings,
            source_offset_secs: self.source_offset_secs,
        }
    }
}
