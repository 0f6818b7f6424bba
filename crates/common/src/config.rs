//! Application configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LockstepError, LockstepResult};

/// Global application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Drift coordinator tuning.
    pub sync: SyncConfig,

    /// Live playback behaviour.
    pub playback: PlaybackConfig,

    /// Compositor settings.
    pub compositor: CompositorConfig,

    /// Export defaults.
    pub export: ExportSettings,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Parameters of the two-tier drift correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Coordinator tick interval (ms). Valid range 16..=100.
    pub tick_interval_ms: u64,

    /// Average drift above which a smooth correction is issued (s).
    pub correction_threshold_secs: f64,

    /// Single-sample drift at or above which a hard re-seek is issued (s).
    pub snap_threshold_secs: f64,

    /// Fraction of the average drift applied per smooth correction.
    pub correction_gain: f64,

    /// Smooth corrections allowed before escalating to a hard re-seek.
    pub max_smooth_corrections: u32,

    /// Consecutive hard re-seeks before drift is reported unrecoverable.
    pub max_snaps: u32,

    /// Interval between statistics reports (ms).
    pub stats_interval_ms: u64,
}

/// Live playback loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Nominal composition frame rate used for frame ranges.
    pub frame_rate: f64,

    /// Display refresh rate the render loop is paced to (Hz).
    pub display_hz: u32,

    /// How far a matte may wander from its media before it is re-seeked (s).
    pub matte_tolerance_secs: f64,

    /// Restart from zero when the end of the composition is reached.
    pub loop_playback: bool,
}

/// Luminance coefficient set used to derive matte alpha.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LumaWeights {
    #[default]
    Bt709,
    Bt601,
    Custom([f32; 3]),
}

impl LumaWeights {
    /// RGB coefficients.
    pub fn coefficients(&self) -> [f32; 3] {
        match self {
            LumaWeights::Bt709 => [0.2126, 0.7152, 0.0722],
            LumaWeights::Bt601 => [0.299, 0.587, 0.114],
            LumaWeights::Custom(w) => *w,
        }
    }

    /// Weights must be finite, non-negative, and not all zero.
    pub fn is_valid(&self) -> bool {
        let w = self.coefficients();
        w.iter().all(|c| c.is_finite() && *c >= 0.0) && w.iter().sum::<f32>() > 0.0
    }
}

/// Which rendering backend the compositor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// CPU rasterizer. Always available.
    #[default]
    Software,
    /// wgpu pipeline (requires the `gpu` feature).
    Gpu,
}

/// Compositor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Framebuffer width in pixels.
    pub width: u32,

    /// Framebuffer height in pixels.
    pub height: u32,

    /// Rendering backend.
    pub backend: BackendKind,

    /// Matte luminance weights.
    pub luma_weights: LumaWeights,

    /// Texture units available to layers (each layer uses one, plus one per matte).
    pub max_texture_units: u32,

    /// Framebuffer clear colour (straight RGBA, 0..1).
    pub clear_color: [f32; 4],
}

/// Export container/codec choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    /// VP9 with alpha in WebM.
    #[default]
    WebmVp9,
    /// H.264 in MP4 (alpha flattened).
    Mp4H264,
    /// Numbered PNG files.
    PngSequence,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::WebmVp9 => "webm",
            ExportFormat::Mp4H264 => "mp4",
            ExportFormat::PngSequence => "",
        }
    }
}

/// Export defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Output width in pixels.
    pub width: u32,

    /// Output height in pixels.
    pub height: u32,

    /// Output format.
    pub format: ExportFormat,

    /// Maximum distance between a reported and a requested seek time (s).
    pub seek_epsilon_secs: f64,

    /// Re-issued seeks allowed per source per frame.
    pub max_seek_retries: u32,

    /// How long to wait for a source to become ready (ms).
    pub ready_timeout_ms: u64,

    /// Video bitrate (kbps) passed to the encoder.
    pub video_bitrate_kbps: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "lockstep_clock=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            correction_threshold_secs: 0.005,
            snap_threshold_secs: 0.150,
            correction_gain: 0.5,
            max_smooth_corrections: 4,
            max_snaps: 3,
            stats_interval_ms: 1_000,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30.0,
            display_hz: 60,
            matte_tolerance_secs: 0.1,
            loop_playback: true,
        }
    }
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            backend: BackendKind::Software,
            luma_weights: LumaWeights::Bt709,
            max_texture_units: 16,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: ExportFormat::WebmVp9,
            seek_epsilon_secs: 0.010,
            max_seek_retries: 5,
            ready_timeout_ms: 2_000,
            video_bitrate_kbps: 8_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> LockstepResult<()> {
        if !(16..=100).contains(&self.tick_interval_ms) {
            return Err(LockstepError::config(format!(
                "sync.tick_interval_ms must be within 16..=100, got {}",
                self.tick_interval_ms
            )));
        }
        if !(self.correction_threshold_secs > 0.0) {
            return Err(LockstepError::config(
                "sync.correction_threshold_secs must be positive",
            ));
        }
        if !(self.snap_threshold_secs > self.correction_threshold_secs) {
            return Err(LockstepError::config(
                "sync.snap_threshold_secs must exceed sync.correction_threshold_secs",
            ));
        }
        if !(self.correction_gain > 0.0 && self.correction_gain <= 1.0) {
            return Err(LockstepError::config(
                "sync.correction_gain must be within (0, 1]",
            ));
        }
        if self.stats_interval_ms == 0 {
            return Err(LockstepError::config("sync.stats_interval_ms must be non-zero"));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load and validate config from an explicit path.
    pub fn load_from(path: impl AsRef<Path>) -> LockstepResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LockstepError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(config_file_path())
    }

    /// Save config to an explicit path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Check value ranges across all sections.
    pub fn validate(&self) -> LockstepResult<()> {
        self.sync.validate()?;

        if !(self.playback.frame_rate > 0.0 && self.playback.frame_rate.is_finite()) {
            return Err(LockstepError::config("playback.frame_rate must be positive"));
        }
        if self.playback.display_hz == 0 {
            return Err(LockstepError::config("playback.display_hz must be non-zero"));
        }
        if !self.compositor.luma_weights.is_valid() {
            return Err(LockstepError::config(
                "compositor.luma_weights must be finite, non-negative and not all zero",
            ));
        }
        if self.compositor.width == 0 || self.compositor.height == 0 {
            return Err(LockstepError::config("compositor size must be non-zero"));
        }
        if self.export.width == 0 || self.export.height == 0 {
            return Err(LockstepError::config("export size must be non-zero"));
        }
        if !(self.export.seek_epsilon_secs > 0.0) {
            return Err(LockstepError::config(
                "export.seek_epsilon_secs must be positive",
            ));
        }
        if self.export.max_seek_retries == 0 {
            return Err(LockstepError::config(
                "export.max_seek_retries must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("lockstep").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.tick_interval_ms, 16);
        assert!((config.sync.snap_threshold_secs - 0.150).abs() < 1e-12);
        assert!((config.export.seek_epsilon_secs - 0.010).abs() < 1e-12);
    }

    #[test]
    fn test_tick_interval_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.sync.tick_interval_ms = 5;
        assert!(matches!(
            config.validate(),
            Err(LockstepError::Config { .. })
        ));
    }

    #[test]
    fn test_snap_threshold_must_exceed_correction_threshold() {
        let mut config = AppConfig::default();
        config.sync.snap_threshold_secs = 0.001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_luma_weights_rejected() {
        let mut config = AppConfig::default();
        config.compositor.luma_weights = LumaWeights::Custom([0.0, 0.0, 0.0]);
        assert!(config.validate().is_err());
        config.compositor.luma_weights = LumaWeights::Custom([f32::NAN, 0.5, 0.5]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"sync": {"correction_gain": 0.25}}"#).unwrap();
        assert!((config.sync.correction_gain - 0.25).abs() < 1e-12);
        assert_eq!(config.sync.max_snaps, 3);
        assert_eq!(config.compositor.luma_weights, LumaWeights::Bt709);
    }

    #[test]
    fn test_save_and_load_roundtrip_through_file() {
        let path = std::env::temp_dir()
            .join("lockstep_test_config")
            .join("config.json");
        let mut config = AppConfig::default();
        config.export.format = ExportFormat::PngSequence;
        config.compositor.luma_weights = LumaWeights::Bt601;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.export.format, ExportFormat::PngSequence);
        assert_eq!(loaded.compositor.luma_weights, LumaWeights::Bt601);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_load_from_missing_file() {
        let missing = std::env::temp_dir().join("lockstep_definitely_missing.json");
        assert!(matches!(
            AppConfig::load_from(&missing),
            Err(LockstepError::FileNotFound { .. })
        ));
    }
}
