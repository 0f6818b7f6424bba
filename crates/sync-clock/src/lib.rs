//! Lockstep Clock Coordinator
//!
//! Keeps every non-master media source phase-locked to the master source.
//!
//! The coordinator samples each source's reported media time against where
//! the master clock says it should be and corrects in two tiers:
//!
//! ```text
//!   onFrame ──► drift = media − master(wall)
//!                 │
//!                 ├── |drift| ≥ snap threshold ──► HardSeek (event path)
//!                 │
//!                 └── accumulate ──► tick ──► |avg| > threshold ──► Nudge(avg · gain)
//!                                               │
//!                                               └── too many nudges ──► HardSeek
//! ```
//!
//! [`coordinator::DriftCoordinator`] is the pure state machine; [`worker`]
//! runs it on an isolated tokio task that only talks through channels.

pub mod coordinator;
pub mod state;
pub mod worker;

pub use coordinator::*;
pub use state::*;
pub use worker::*;
