//! The media source contract and generation-tagged source slots.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;

use lockstep_common::{Generation, GenerationCounter, LockstepError, LockstepResult, SourceId};

/// A decoding media element: a video, an image sequence, a generator.
///
/// Decoding itself is out of scope; implementors expose their current
/// presentation time and frame and accept transport commands. Seeks are
/// asynchronous and report where the source actually landed, which may
/// differ from the requested time.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn id(&self) -> &SourceId;

    /// Current presentation time in media seconds.
    fn current_time(&self) -> f64;

    /// Media duration in seconds.
    fn duration(&self) -> f64;

    /// Whether the current frame is decoded and presentable.
    fn is_ready(&self) -> bool;

    /// Decoder error, if the source has failed.
    fn error(&self) -> Option<String> {
        None
    }

    fn is_playing(&self) -> bool;

    fn is_looping(&self) -> bool;

    fn set_looping(&mut self, looping: bool);

    /// Frame at the current presentation time.
    fn current_frame(&self) -> Option<Arc<RgbaImage>>;

    /// Audio stream that can be copied into an export, if any.
    fn audio_track(&self) -> Option<PathBuf> {
        None
    }

    /// Shift the presentation clock by `delta_secs` without seeking.
    fn nudge(&mut self, delta_secs: f64);

    /// Seek and return the time the source reports after settling.
    async fn seek(&mut self, time_secs: f64) -> LockstepResult<f64>;

    async fn play(&mut self) -> LockstepResult<()>;

    async fn pause(&mut self) -> LockstepResult<()>;

    /// Free decoder resources. The source is not used afterwards.
    fn release(&mut self) {}
}

/// Result of a generation-tagged source operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub generation: Generation,
    /// Presentation time reported when the operation settled.
    pub reported_secs: f64,
}

/// Transport state of one source, captured so it can be put back.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub source_id: SourceId,
    pub time_secs: f64,
    pub looping: bool,
    pub playing: bool,
}

/// Exclusive owner of one media source.
///
/// Every transport call takes a fresh generation. A completion is only
/// meaningful while its generation is still the latest; see [`SourceSlot::accept`].
pub struct SourceSlot {
    source: Box<dyn MediaSource>,
    generations: GenerationCounter,
}

impl std::fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSlot")
            .field("id", self.source.id())
            .field("generation", &self.generations.current())
            .finish()
    }
}

impl SourceSlot {
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        Self {
            source,
            generations: GenerationCounter::new(),
        }
    }

    pub fn id(&self) -> &SourceId {
        self.source.id()
    }

    pub fn source(&self) -> &dyn MediaSource {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut dyn MediaSource {
        self.source.as_mut()
    }

    pub fn generations(&self) -> &GenerationCounter {
        &self.generations
    }

    /// Ready and not errored.
    pub fn is_usable(&self) -> bool {
        self.source.is_ready() && self.source.error().is_none()
    }

    pub async fn seek(&mut self, time_secs: f64) -> LockstepResult<Completion> {
        let generation = self.generations.issue();
        let reported_secs = self.source.seek(time_secs).await?;
        Ok(Completion {
            generation,
            reported_secs,
        })
    }

    pub async fn play(&mut self) -> LockstepResult<Completion> {
        let generation = self.generations.issue();
        self.source.play().await?;
        Ok(Completion {
            generation,
            reported_secs: self.source.current_time(),
        })
    }

    pub async fn pause(&mut self) -> LockstepResult<Completion> {
        let generation = self.generations.issue();
        self.source.pause().await?;
        Ok(Completion {
            generation,
            reported_secs: self.source.current_time(),
        })
    }

    /// The reported time of `completion`, or `None` if a newer operation
    /// has been issued since.
    pub fn accept(&self, completion: &Completion) -> Option<f64> {
        if self.generations.is_current(completion.generation) {
            Some(completion.reported_secs)
        } else {
            tracing::debug!(
                source = %self.id(),
                generation = %completion.generation,
                latest = %self.generations.current(),
                "Ignoring stale completion"
            );
            None
        }
    }

    /// Poll until the source is ready or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> LockstepResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(error) = self.source.error() {
                return Err(LockstepError::media(format!(
                    "source {} failed: {error}",
                    self.id()
                )));
            }
            if self.source.is_ready() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockstepError::SourceNotReady {
                    source_id: self.id().clone(),
                });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            source_id: self.id().clone(),
            time_secs: self.source.current_time(),
            looping: self.source.is_looping(),
            playing: self.source.is_playing(),
        }
    }

    /// Put the source back into a previously captured transport state.
    ///
    /// Every step is attempted even when an earlier one fails; the first
    /// error is returned.
    pub async fn restore(&mut self, snapshot: &PlaybackSnapshot) -> LockstepResult<()> {
        let seeked = self.seek(snapshot.time_secs).await.map(|_| ());
        self.source.set_looping(snapshot.looping);
        let transport = if snapshot.playing {
            self.play().await
        } else {
            self.pause().await
        };
        seeked.and(transport.map(|_| ()))
    }

    /// Stop the source and free it. Pause failures are logged, not returned.
    pub async fn release(mut self) {
        if self.source.is_playing() {
            if let Err(e) = self.source.pause().await {
                tracing::warn!(source = %self.id(), error = %e, "Pause before release failed");
            }
        }
        self.generations.issue();
        self.source.release();
        tracing::debug!(source = %self.id(), "Source released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SyntheticPattern, SyntheticSource};
    use lockstep_common::{ManualClock, WallClock};

    #[tokio::test]
    async fn test_restore_applies_loop_and_play_when_seek_fails() {
        let clock: Arc<dyn WallClock> = Arc::new(ManualClock::new(0.0));
        let mut slot = SourceSlot::new(Box::new(
            SyntheticSource::new("broken", SyntheticPattern::Gray(10), clock)
                .with_error("decoder gone"),
        ));
        let saved = PlaybackSnapshot {
            source_id: SourceId::new("broken"),
            time_secs: 1.0,
            looping: true,
            playing: true,
        };
        slot.source_mut().set_looping(false);

        let result = slot.restore(&saved).await;

        assert!(result.is_err());
        assert!(slot.source().is_looping());
        assert!(slot.source().is_playing());
    }
}
