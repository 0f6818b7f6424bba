//! Generation counters for tagging asynchronous operations.
//!
//! Every seek/play/pause issued against a source takes a fresh generation.
//! When the operation completes, its result is only applied if its
//! generation is still the latest one issued; anything older was
//! superseded while it was in flight.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A monotonically increasing operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation before any operation was issued.
    pub const INITIAL: Generation = Generation(0);
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Shared per-source generation counter.
///
/// Clones share the same underlying counter, so a completion future holding
/// a clone can check whether it has been superseded.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter {
    latest: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new generation, superseding all earlier ones.
    pub fn issue(&self) -> Generation {
        Generation(self.latest.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// The most recently issued generation.
    pub fn current(&self) -> Generation {
        Generation(self.latest.load(Ordering::Acquire))
    }

    /// Whether `generation` is still the latest issued.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }
}
