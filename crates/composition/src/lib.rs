//! Lockstep Composition Model
//!
//! Defines the data model the compositor and coordinators work on:
//! - **Layers:** z-ordered, frame-ranged, transformed and corner-pinned
//! - **Media sources:** the async contract every decoder implements
//! - **Composition:** layer list, master clock assignment, transport
//! - **Documents:** JSON persistence of a composition
//!
//! Corner pins live in the canonical 3840×2160 canvas space regardless of
//! the size the composite is rendered at.

pub mod composition;
pub mod document;
pub mod geometry;
pub mod layer;
pub mod media;
pub mod sources;
pub mod time;

pub use composition::*;
pub use document::*;
pub use geometry::*;
pub use layer::*;
pub use media::*;
pub use time::*;
