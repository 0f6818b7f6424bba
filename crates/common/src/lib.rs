//! Lockstep Common Utilities
//!
//! Shared infrastructure for all Lockstep crates:
//! - Error types and result aliases
//! - Source and layer identifiers, generation counters
//! - Wall clocks, drift measurement and rate pacing
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod generation;
pub mod ids;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use generation::*;
pub use ids::*;
