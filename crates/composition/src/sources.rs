//! Built-in media sources.
//!
//! Lockstep does not decode video itself. These sources make the engine
//! usable without a decoder: a frame generator for tests and previews, and
//! a directory of stills played back at a fixed rate.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use lockstep_common::{LockstepError, LockstepResult, SourceId, WallClock};

use crate::media::MediaSource;
use crate::time::frame_index;

/// Wall-clock driven presentation time shared by the built-in sources.
#[derive(Debug, Clone)]
struct Transport {
    clock: Arc<dyn WallClock>,
    duration: f64,
    base_secs: f64,
    anchor_wall: f64,
    playing: bool,
    looping: bool,
}

impl Transport {
    fn new(clock: Arc<dyn WallClock>, duration: f64) -> Self {
        Self {
            clock,
            duration: duration.max(0.0),
            base_secs: 0.0,
            anchor_wall: 0.0,
            playing: false,
            looping: false,
        }
    }

    fn current(&self) -> f64 {
        let raw = if self.playing {
            self.base_secs + (self.clock.now_secs() - self.anchor_wall)
        } else {
            self.base_secs
        };
        if self.looping && self.duration > 0.0 {
            raw.rem_euclid(self.duration)
        } else {
            raw.clamp(0.0, self.duration)
        }
    }

    fn set_position(&mut self, secs: f64) -> f64 {
        self.base_secs = secs.clamp(0.0, self.duration);
        self.anchor_wall = self.clock.now_secs();
        self.base_secs
    }

    fn play(&mut self) {
        if !self.playing {
            self.base_secs = self.current();
            self.anchor_wall = self.clock.now_secs();
            self.playing = true;
        }
    }

    fn pause(&mut self) {
        if self.playing {
            self.base_secs = self.current();
            self.playing = false;
        }
    }

    fn nudge(&mut self, delta_secs: f64) {
        self.base_secs = (self.base_secs + delta_secs).max(0.0);
    }
}

/// Pixel content of a [`SyntheticSource`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SyntheticPattern {
    /// Every pixel the same straight-alpha colour.
    Solid([u8; 4]),
    /// Opaque gray at the given level. Useful as a matte.
    Gray(u8),
    /// Horizontal red ramp, vertical green ramp, frame index in blue.
    Gradient,
    /// Frame index encoded in red (low byte) and green (high byte).
    FrameCounter,
}

impl SyntheticPattern {
    fn render(&self, width: u32, height: u32, frame: u64) -> RgbaImage {
        match *self {
            SyntheticPattern::Solid(c) => RgbaImage::from_pixel(width, height, Rgba(c)),
            SyntheticPattern::Gray(v) => RgbaImage::from_pixel(width, height, Rgba([v, v, v, 255])),
            SyntheticPattern::Gradient => RgbaImage::from_fn(width, height, |x, y| {
                let r = (x * 255 / width.max(2).saturating_sub(1)).min(255) as u8;
                let g = (y * 255 / height.max(2).saturating_sub(1)).min(255) as u8;
                Rgba([r, g, (frame % 256) as u8, 255])
            }),
            SyntheticPattern::FrameCounter => RgbaImage::from_pixel(
                width,
                height,
                Rgba([(frame % 256) as u8, ((frame / 256) % 256) as u8, 0, 255]),
            ),
        }
    }
}

/// How a [`SyntheticSource`] responds to seeks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekProfile {
    /// Simulated decoder latency per seek.
    pub latency: Duration,
    /// The first this-many seeks land `miss_secs` away from the target.
    pub inexact_seeks: u32,
    pub miss_secs: f64,
}

impl SeekProfile {
    /// Instant, exact seeks.
    pub const EXACT: SeekProfile = SeekProfile {
        latency: Duration::ZERO,
        inexact_seeks: 0,
        miss_secs: 0.0,
    };

    /// Seeks that never land within `miss_secs` of the target.
    pub fn never_converges(miss_secs: f64) -> Self {
        Self {
            latency: Duration::ZERO,
            inexact_seeks: u32::MAX,
            miss_secs,
        }
    }
}

impl Default for SeekProfile {
    fn default() -> Self {
        Self::EXACT
    }
}

/// Generated frames with a wall-clock driven presentation time.
pub struct SyntheticSource {
    id: SourceId,
    width: u32,
    height: u32,
    frame_rate: f64,
    pattern: SyntheticPattern,
    transport: Transport,
    ready: bool,
    error: Option<String>,
    seek_profile: SeekProfile,
    seeks: Arc<AtomicU64>,
    audio: Option<PathBuf>,
    released: bool,
    cache: Mutex<Option<(u64, Arc<RgbaImage>)>>,
}

impl SyntheticSource {
    pub fn new(id: impl Into<SourceId>, pattern: SyntheticPattern, clock: Arc<dyn WallClock>) -> Self {
        Self {
            id: id.into(),
            width: 64,
            height: 36,
            frame_rate: 30.0,
            pattern,
            transport: Transport::new(clock, 10.0),
            ready: true,
            error: None,
            seek_profile: SeekProfile::EXACT,
            seeks: Arc::new(AtomicU64::new(0)),
            audio: None,
            released: false,
            cache: Mutex::new(None),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.transport.duration = duration_secs.max(0.0);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        if frame_rate > 0.0 {
            self.frame_rate = frame_rate;
        }
        self
    }

    pub fn with_seek_profile(mut self, profile: SeekProfile) -> Self {
        self.seek_profile = profile;
        self
    }

    pub fn with_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.audio = Some(path.into());
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Shared count of seeks issued to this source.
    pub fn seek_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.seeks)
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn current_time(&self) -> f64 {
        self.transport.current()
    }

    fn duration(&self) -> f64 {
        self.transport.duration
    }

    fn is_ready(&self) -> bool {
        self.ready && !self.released
    }

    fn error(&self) -> Option<String> {
        self.error.clone()
    }

    fn is_playing(&self) -> bool {
        self.transport.playing
    }

    fn is_looping(&self) -> bool {
        self.transport.looping
    }

    fn set_looping(&mut self, looping: bool) {
        self.transport.looping = looping;
    }

    fn current_frame(&self) -> Option<Arc<RgbaImage>> {
        if !self.is_ready() || self.error.is_some() {
            return None;
        }
        let frame = frame_index(self.current_time(), self.frame_rate).unwrap_or(0);
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((cached, image)) = cache.as_ref() {
            if *cached == frame {
                return Some(Arc::clone(image));
            }
        }
        let image = Arc::new(self.pattern.render(self.width, self.height, frame));
        *cache = Some((frame, Arc::clone(&image)));
        Some(image)
    }

    fn audio_track(&self) -> Option<PathBuf> {
        self.audio.clone()
    }

    fn nudge(&mut self, delta_secs: f64) {
        self.transport.nudge(delta_secs);
    }

    async fn seek(&mut self, time_secs: f64) -> LockstepResult<f64> {
        if let Some(error) = &self.error {
            return Err(LockstepError::media(format!("{}: {error}", self.id)));
        }
        if !self.seek_profile.latency.is_zero() {
            tokio::time::sleep(self.seek_profile.latency).await;
        }
        let issued = self.seeks.fetch_add(1, Ordering::AcqRel);
        let target = if issued < u64::from(self.seek_profile.inexact_seeks) {
            time_secs + self.seek_profile.miss_secs
        } else {
            time_secs
        };
        self.transport.set_position(target);
        Ok(self.transport.current())
    }

    async fn play(&mut self) -> LockstepResult<()> {
        self.transport.play();
        Ok(())
    }

    async fn pause(&mut self) -> LockstepResult<()> {
        self.transport.pause();
        Ok(())
    }

    fn release(&mut self) {
        self.transport.pause();
        self.released = true;
        *self.cache.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// A directory of still images played at a fixed frame rate.
pub struct ImageSequenceSource {
    id: SourceId,
    frames: Vec<PathBuf>,
    frame_rate: f64,
    transport: Transport,
    audio: Option<PathBuf>,
    cache: Mutex<Option<(usize, Arc<RgbaImage>)>>,
    error: Mutex<Option<String>>,
}

impl ImageSequenceSource {
    /// Index the images (png, jpg, jpeg) in `dir`, sorted by file name.
    pub fn open(
        id: impl Into<SourceId>,
        dir: impl AsRef<Path>,
        frame_rate: f64,
        clock: Arc<dyn WallClock>,
    ) -> LockstepResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LockstepError::FileNotFound {
                path: dir.to_path_buf(),
            });
        }
        if !(frame_rate > 0.0) {
            return Err(LockstepError::asset_binding(format!(
                "invalid frame rate {frame_rate} for {}",
                dir.display()
            )));
        }

        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(LockstepError::asset_binding(format!(
                "no images found in {}",
                dir.display()
            )));
        }

        let duration = frames.len() as f64 / frame_rate;
        tracing::debug!(
            dir = %dir.display(),
            frames = frames.len(),
            duration_secs = duration,
            "Indexed image sequence"
        );

        Ok(Self {
            id: id.into(),
            frames,
            frame_rate,
            transport: Transport::new(clock, duration),
            audio: None,
            cache: Mutex::new(None),
            error: Mutex::new(None),
        })
    }

    pub fn with_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.audio = Some(path.into());
        self
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame_at(&self, secs: f64) -> usize {
        let index = frame_index(secs, self.frame_rate).unwrap_or(0) as usize;
        index.min(self.frames.len() - 1)
    }
}

#[async_trait]
impl MediaSource for ImageSequenceSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn current_time(&self) -> f64 {
        self.transport.current()
    }

    fn duration(&self) -> f64 {
        self.transport.duration
    }

    fn is_ready(&self) -> bool {
        !self.frames.is_empty()
    }

    fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn is_playing(&self) -> bool {
        self.transport.playing
    }

    fn is_looping(&self) -> bool {
        self.transport.looping
    }

    fn set_looping(&mut self, looping: bool) {
        self.transport.looping = looping;
    }

    fn current_frame(&self) -> Option<Arc<RgbaImage>> {
        let index = self.frame_at(self.current_time());
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((cached, image)) = cache.as_ref() {
            if *cached == index {
                return Some(Arc::clone(image));
            }
        }

        let path = &self.frames[index];
        match image::open(path) {
            Ok(decoded) => {
                let image = Arc::new(decoded.to_rgba8());
                *cache = Some((index, Arc::clone(&image)));
                Some(image)
            }
            Err(e) => {
                tracing::warn!(source = %self.id, path = %path.display(), error = %e, "Failed to decode frame");
                *self.error.lock().unwrap_or_else(|p| p.into_inner()) =
                    Some(format!("failed to decode {}: {e}", path.display()));
                None
            }
        }
    }

    fn audio_track(&self) -> Option<PathBuf> {
        self.audio.clone()
    }

    fn nudge(&mut self, delta_secs: f64) {
        self.transport.nudge(delta_secs);
    }

    async fn seek(&mut self, time_secs: f64) -> LockstepResult<f64> {
        self.transport.set_position(time_secs);
        Ok(self.transport.current())
    }

    async fn play(&mut self) -> LockstepResult<()> {
        self.transport.play();
        Ok(())
    }

    async fn pause(&mut self) -> LockstepResult<()> {
        self.transport.pause();
        Ok(())
    }

    fn release(&mut self) {
        self.transport.pause();
        *self.cache.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_common::ManualClock;

    fn clock() -> (ManualClock, Arc<dyn WallClock>) {
        let clock = ManualClock::new(0.0);
        (clock.clone(), Arc::new(clock))
    }

    #[tokio::test]
    async fn test_synthetic_playback_follows_wall_clock() {
        let (manual, clock) = clock();
        let mut source = SyntheticSource::new("s", SyntheticPattern::Gray(128), clock);
        source.play().await.unwrap();
        manual.advance(1.5);
        assert!((source.current_time() - 1.5).abs() < 1e-9);
        source.pause().await.unwrap();
        manual.advance(3.0);
        assert!((source.current_time() - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_synthetic_loops_when_looping() {
        let (manual, clock) = clock();
        let mut source =
            SyntheticSource::new("s", SyntheticPattern::Gray(0), clock).with_duration(2.0);
        source.set_looping(true);
        source.play().await.unwrap();
        manual.advance(2.5);
        assert!((source.current_time() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_inexact_seeks_then_exact() {
        let (_manual, clock) = clock();
        let mut source = SyntheticSource::new("s", SyntheticPattern::Gray(0), clock)
            .with_seek_profile(SeekProfile {
                latency: Duration::ZERO,
                inexact_seeks: 1,
                miss_secs: 0.05,
            });
        let first = source.seek(1.0).await.unwrap();
        assert!((first - 1.05).abs() < 1e-9);
        let second = source.seek(1.0).await.unwrap();
        assert!((second - 1.0).abs() < 1e-9);
        assert_eq!(source.seek_counter().load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn test_nudge_shifts_presentation_time() {
        let (_manual, clock) = clock();
        let mut source = SyntheticSource::new("s", SyntheticPattern::Gray(0), clock);
        source.seek(2.0).await.unwrap();
        source.nudge(-0.01);
        assert!((source.current_time() - 1.99).abs() < 1e-9);
    }

    #[test]
    fn test_frame_counter_pattern_encodes_index() {
        let image = SyntheticPattern::FrameCounter.render(4, 4, 300);
        assert_eq!(image.get_pixel(0, 0).0, [44, 1, 0, 255]);
    }

    #[tokio::test]
    async fn test_frame_cache_tracks_frame_index() {
        let (_manual, clock) = clock();
        let mut source = SyntheticSource::new("s", SyntheticPattern::FrameCounter, clock);
        source.seek(0.5).await.unwrap();
        assert_eq!(source.current_frame().unwrap().get_pixel(0, 0).0[0], 15);
        source.seek(1.0).await.unwrap();
        assert_eq!(source.current_frame().unwrap().get_pixel(0, 0).0[0], 30);
    }

    #[test]
    fn test_not_ready_source_has_no_frame() {
        let (_manual, clock) = clock();
        let source = SyntheticSource::new("s", SyntheticPattern::Gray(0), clock).with_ready(false);
        assert!(source.current_frame().is_none());
    }

    #[tokio::test]
    async fn test_image_sequence_from_directory() {
        let dir = std::env::temp_dir().join("lockstep_test_image_sequence");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..3u8 {
            RgbaImage::from_pixel(2, 2, Rgba([i * 100, 0, 0, 255]))
                .save(dir.join(format!("frame_{i:03}.png")))
                .unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let (_manual, clock) = clock();
        let mut source = ImageSequenceSource::open("seq", &dir, 10.0, clock).unwrap();
        assert_eq!(source.frame_count(), 3);
        assert!((source.duration() - 0.3).abs() < 1e-9);

        source.seek(0.15).await.unwrap();
        assert_eq!(source.current_frame().unwrap().get_pixel(0, 0).0[0], 100);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_directory_is_binding_error() {
        let dir = std::env::temp_dir().join("lockstep_test_empty_sequence");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let (_manual, clock) = clock();
        assert!(matches!(
            ImageSequenceSource::open("seq", &dir, 30.0, clock),
            Err(LockstepError::AssetBinding { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
