//! Lockstep Render Engine
//!
//! Composites the active layers of a composition into one frame, drives
//! live playback against the clock coordinator, and exports the
//! composite frame by frame.
//!
//! # Pipeline Architecture
//!
//! ```text
//! layer media ──┐
//!               ├── texture slot (per layer, role)
//! layer matte ──┘         │
//!                         ├── matrix · corner-pin uv · luma matte
//!                         │
//!          z-ordered ─────┴──► premultiplied over ──► framebuffer
//!                                                        │
//!             live:  PlaybackLoop::tick ◄────────────────┤
//!                                                        │
//!   export:  seek ─► converge ─► render ─► capture ─► VideoEncoder
//!                                                        │
//!                                                        ▼
//!                                             output.webm / frames/*.png
//! ```
//!
//! The software backend is always available. The `gpu` feature adds a
//! wgpu backend running the same math in WGSL.

pub mod backend;
pub mod compositor;
pub mod encode;
pub mod export;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod playback;
pub mod raster;
pub mod texture;
pub mod uniforms;

pub use backend::*;
pub use compositor::*;
pub use encode::*;
pub use export::*;
#[cfg(feature = "gpu")]
pub use gpu::WgpuBackend;
pub use playback::*;
pub use raster::SoftwareBackend;
pub use texture::*;
pub use uniforms::LayerUniforms;

/// Whether this build includes the wgpu backend.
pub const GPU_AVAILABLE: bool = cfg!(feature = "gpu");
