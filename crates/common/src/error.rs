//! Error types shared across Lockstep crates.

use std::path::PathBuf;

use crate::ids::{LayerId, SourceId};

/// Top-level error type for Lockstep operations.
#[derive(Debug, thiserror::Error)]
pub enum LockstepError {
    /// A media source was used before it reported ready.
    #[error("Source {source_id} is not ready")]
    SourceNotReady { source_id: SourceId },

    /// A source never settled within epsilon of the requested export time.
    #[error(
        "Source {source_id} did not converge on frame {frame}: \
         target {target_secs:.4}s, reported {reported_secs:.4}s after {attempts} attempts"
    )]
    SeekConvergence {
        source_id: SourceId,
        frame: u64,
        target_secs: f64,
        reported_secs: f64,
        attempts: u32,
    },

    /// Graphics backend, shader, or pipeline construction failed.
    #[error("Compositor initialization failed: {message}")]
    CompositorInit { message: String },

    /// Hard re-seeks kept failing to bring a source back onto the master clock.
    #[error("Drift on source {source_id} is unrecoverable ({drift_secs:+.4}s after {snaps} re-seeks)")]
    DriftUnrecoverable {
        source_id: SourceId,
        drift_secs: f64,
        snaps: u32,
    },

    #[error("Encode error: {message}")]
    Encode { message: String },

    /// A layer could not be bound to the requested media.
    #[error("Asset binding error: {message}")]
    AssetBinding { message: String },

    #[error("Invalid frame range: start {start} is after end {end}")]
    InvalidFrameRange { start: u64, end: u64 },

    #[error("Master layer error: {message}")]
    MasterLayer { message: String },

    #[error("Layer not found: {layer_id}")]
    LayerNotFound { layer_id: LayerId },

    #[error("Composition error: {message}")]
    Composition { message: String },

    #[error("Media error: {message}")]
    Media { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Clock coordinator is not running")]
    ClockUnavailable,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using LockstepError.
pub type LockstepResult<T> = Result<T, LockstepError>;

impl LockstepError {
    pub fn compositor_init(msg: impl Into<String>) -> Self {
        Self::CompositorInit {
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
        }
    }

    pub fn asset_binding(msg: impl Into<String>) -> Self {
        Self::AssetBinding {
            message: msg.into(),
        }
    }

    pub fn master_layer(msg: impl Into<String>) -> Self {
        Self::MasterLayer {
            message: msg.into(),
        }
    }

    pub fn composition(msg: impl Into<String>) -> Self {
        Self::Composition {
            message: msg.into(),
        }
    }

    pub fn media(msg: impl Into<String>) -> Self {
        Self::Media {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error aborts an export. Live playback only degrades on these.
    pub fn is_fatal_for_export(&self) -> bool {
        !matches!(self, Self::DriftUnrecoverable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_convergence_message_names_frame_and_source() {
        let err = LockstepError::SeekConvergence {
            source_id: SourceId::new("overlay"),
            frame: 42,
            target_secs: 1.4,
            reported_secs: 1.45,
            attempts: 5,
        };
        let text = err.to_string();
        assert!(text.contains("overlay"));
        assert!(text.contains("frame 42"));
        assert!(text.contains("5 attempts"));
    }

    #[test]
    fn test_drift_unrecoverable_is_not_fatal_for_export() {
        let drift = LockstepError::DriftUnrecoverable {
            source_id: SourceId::new("a"),
            drift_secs: 0.4,
            snaps: 4,
        };
        assert!(!drift.is_fatal_for_export());
        assert!(LockstepError::encode("pipe closed").is_fatal_for_export());
    }
}
