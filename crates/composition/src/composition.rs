//! The composition: ordered layers, master clock assignment, and transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use lockstep_clock::ClockHandle;
use lockstep_common::{LayerId, LockstepError, LockstepResult, SourceId, WallClock};

use crate::document::MediaDescriptor;
use crate::layer::{CornerPin, FrameRange, Layer, LayerParams, MatteSettings, Transform};
use crate::media::{MediaSource, PlaybackSnapshot, SourceSlot};
use crate::time::CompositionTime;

const EVENT_CAPACITY: usize = 256;

/// Notifications for editing surfaces and tools.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositionEvent {
    TimeUpdate { time_secs: f64 },
    Played { time_secs: f64 },
    Paused { time_secs: f64 },
    Seeked { time_secs: f64 },
    LayerAdded(LayerId),
    LayerRemoved(LayerId),
    LayerChanged(LayerId),
    MediaBound { layer_id: LayerId, source_id: SourceId },
    MatteBound { layer_id: LayerId, source_id: SourceId },
    MasterChanged(Option<LayerId>),
    DriftUnrecoverable { source_id: SourceId, drift_secs: f64 },
    SourceError { source_id: SourceId, message: String },
}

/// Which binding of a layer a source occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    Media,
    Matte,
}

/// Transport state captured before an export and restored afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSnapshot {
    pub time_secs: f64,
    pub playing: bool,
    pub sources: Vec<PlaybackSnapshot>,
}

#[derive(Debug, Clone, Copy)]
struct Transport {
    playing: bool,
    anchor_secs: f64,
    anchor_wall: f64,
}

/// A set of layers played against one master clock.
pub struct Composition {
    name: String,
    frame_rate: f64,
    layers: Vec<Layer>,
    next_layer_id: u64,
    master: Option<LayerId>,
    duration_override: Option<f64>,
    clock: Arc<dyn WallClock>,
    sync: Option<ClockHandle>,
    transport: Transport,
    transport_epoch: u64,
    events: broadcast::Sender<CompositionEvent>,
    /// How each bound source was opened, for saving back to a document.
    pub(crate) descriptors: BTreeMap<SourceId, MediaDescriptor>,
}

impl std::fmt::Debug for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composition")
            .field("name", &self.name)
            .field("frame_rate", &self.frame_rate)
            .field("layers", &self.layers)
            .field("master", &self.master)
            .field("duration_override", &self.duration_override)
            .finish()
    }
}

impl Composition {
    pub fn new(frame_rate: f64, clock: Arc<dyn WallClock>) -> LockstepResult<Self> {
        if !(frame_rate > 0.0 && frame_rate.is_finite()) {
            return Err(LockstepError::composition(format!(
                "frame rate must be positive, got {frame_rate}"
            )));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let now = clock.now_secs();
        Ok(Self {
            name: "untitled".to_string(),
            frame_rate,
            layers: Vec::new(),
            next_layer_id: 1,
            master: None,
            duration_override: None,
            clock,
            sync: None,
            transport: Transport {
                playing: false,
                anchor_secs: 0.0,
                anchor_wall: now,
            },
            transport_epoch: 0,
            events,
            descriptors: BTreeMap::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn clock(&self) -> &Arc<dyn WallClock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompositionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: CompositionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Publish an event on behalf of a driver (playback loop, export).
    pub fn notify(&self, event: CompositionEvent) {
        self.emit(event);
    }

    /// Register every bound media source with a running clock coordinator.
    pub fn attach_clock(&mut self, handle: ClockHandle) -> LockstepResult<()> {
        for layer in &self.layers {
            if let Some(media) = layer.media() {
                handle.init(media.id().clone())?;
            }
        }
        if let Some(source) = self.master_source_id() {
            handle.set_master(source)?;
        }
        self.sync = Some(handle);
        Ok(())
    }

    pub fn clock_handle(&self) -> Option<&ClockHandle> {
        self.sync.as_ref()
    }

    fn sync_send(&self, op: impl FnOnce(&ClockHandle) -> LockstepResult<()>) {
        if let Some(handle) = &self.sync {
            if let Err(e) = op(handle) {
                tracing::warn!(error = %e, "Clock coordinator unreachable");
            }
        }
    }

    // ---- layers -------------------------------------------------------

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id() == id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id() == id)
    }

    fn require_layer_mut(&mut self, id: LayerId) -> LockstepResult<&mut Layer> {
        self.layer_mut(id)
            .ok_or(LockstepError::LayerNotFound { layer_id: id })
    }

    pub fn main_layer(&self) -> Option<&Layer> {
        self.layers.first().filter(|l| l.is_main_track())
    }

    /// Add a layer and return its id. The main track is kept first.
    pub fn add_layer(&mut self, params: LayerParams) -> LockstepResult<LayerId> {
        let id = LayerId(self.next_layer_id);
        self.insert_layer(id, params)?;
        Ok(id)
    }

    pub(crate) fn insert_layer(&mut self, id: LayerId, params: LayerParams) -> LockstepResult<()> {
        if params.is_main_track && self.main_layer().is_some() {
            return Err(LockstepError::composition(
                "composition already has a main track",
            ));
        }
        if self.layer(id).is_some() {
            return Err(LockstepError::composition(format!("duplicate layer id {id}")));
        }
        self.next_layer_id = self.next_layer_id.max(id.0 + 1);

        let layer = Layer::new(id, params);
        if layer.is_main_track() {
            self.layers.insert(0, layer);
        } else {
            self.layers.push(layer);
        }
        tracing::debug!(layer = %id, "Layer added");
        self.emit(CompositionEvent::LayerAdded(id));
        Ok(())
    }

    /// Remove a layer and release its sources. The master layer cannot be
    /// removed until mastership is reassigned or cleared.
    pub async fn remove_layer(&mut self, id: LayerId) -> LockstepResult<()> {
        if self.master == Some(id) {
            return Err(LockstepError::master_layer(format!(
                "{id} is the master layer; reassign or clear the master first"
            )));
        }
        let index = self
            .layers
            .iter()
            .position(|l| l.id() == id)
            .ok_or(LockstepError::LayerNotFound { layer_id: id })?;
        let mut layer = self.layers.remove(index);

        if let Some(media) = layer.media.take() {
            let source_id = media.id().clone();
            media.release().await;
            self.descriptors.remove(&source_id);
            self.sync_send(|h| h.remove(source_id));
        }
        if let Some(matte) = layer.matte.take() {
            self.descriptors.remove(matte.id());
            matte.release().await;
        }
        tracing::debug!(layer = %id, "Layer removed");
        self.emit(CompositionEvent::LayerRemoved(id));
        Ok(())
    }

    pub fn update_transform(&mut self, id: LayerId, transform: Transform) -> LockstepResult<()> {
        self.require_layer_mut(id)?.transform = transform;
        self.emit(CompositionEvent::LayerChanged(id));
        Ok(())
    }

    /// Set or clear the corner pin (canonical canvas coordinates).
    pub fn update_corner_pin(
        &mut self,
        id: LayerId,
        corner_pin: Option<CornerPin>,
    ) -> LockstepResult<()> {
        self.require_layer_mut(id)?.corner_pin = corner_pin;
        self.emit(CompositionEvent::LayerChanged(id));
        Ok(())
    }

    /// Change the active frames. An inverted range is rejected and the
    /// layer keeps its previous range.
    pub fn update_frame_range(&mut self, id: LayerId, start: u64, end: u64) -> LockstepResult<()> {
        let range = FrameRange::new(start, end)?;
        self.require_layer_mut(id)?.set_frame_range(range);
        self.emit(CompositionEvent::LayerChanged(id));
        Ok(())
    }

    pub fn update_matte_settings(
        &mut self,
        id: LayerId,
        settings: MatteSettings,
    ) -> LockstepResult<()> {
        self.require_layer_mut(id)?.matte_settings = settings;
        self.emit(CompositionEvent::LayerChanged(id));
        Ok(())
    }

    pub fn update_z_index(&mut self, id: LayerId, z_index: i32) -> LockstepResult<()> {
        self.require_layer_mut(id)?.z_index = z_index;
        self.emit(CompositionEvent::LayerChanged(id));
        Ok(())
    }

    pub fn update_source_offset(&mut self, id: LayerId, offset_secs: f64) -> LockstepResult<()> {
        self.require_layer_mut(id)?.set_source_offset_secs(offset_secs);
        self.emit(CompositionEvent::LayerChanged(id));
        Ok(())
    }

    // ---- source binding ------------------------------------------------

    fn source_in_use(&self, source_id: &SourceId, except: (LayerId, SourceRole)) -> bool {
        self.layers.iter().any(|layer| {
            let media_clash = except != (layer.id(), SourceRole::Media)
                && layer.media().is_some_and(|s| s.id() == source_id);
            let matte_clash = except != (layer.id(), SourceRole::Matte)
                && layer.matte().is_some_and(|s| s.id() == source_id);
            media_clash || matte_clash
        })
    }

    fn validate_source(
        &self,
        id: LayerId,
        role: SourceRole,
        source: &dyn MediaSource,
    ) -> LockstepResult<()> {
        if self.layer(id).is_none() {
            return Err(LockstepError::LayerNotFound { layer_id: id });
        }
        if let Some(error) = source.error() {
            return Err(LockstepError::asset_binding(format!(
                "source {} cannot be bound: {error}",
                source.id()
            )));
        }
        if self.source_in_use(source.id(), (id, role)) {
            return Err(LockstepError::asset_binding(format!(
                "source id {} is already bound to another layer",
                source.id()
            )));
        }
        Ok(())
    }

    /// Bind a layer's media, releasing whatever was bound before.
    pub async fn bind_media(
        &mut self,
        id: LayerId,
        source: Box<dyn MediaSource>,
    ) -> LockstepResult<()> {
        if self.master == Some(id) {
            return Err(LockstepError::master_layer(format!(
                "{id} is the master layer; clear the master before rebinding its media"
            )));
        }
        self.validate_source(id, SourceRole::Media, source.as_ref())?;

        let slot = SourceSlot::new(source);
        let source_id = slot.id().clone();
        let previous = self.require_layer_mut(id)?.media.replace(slot);
        if let Some(previous) = previous {
            let old_id = previous.id().clone();
            previous.release().await;
            if old_id != source_id {
                self.descriptors.remove(&old_id);
            }
            self.sync_send(|h| h.remove(old_id));
        }
        self.sync_send(|h| h.init(source_id.clone()));

        tracing::info!(layer = %id, source = %source_id, "Media bound");
        self.emit(CompositionEvent::MediaBound {
            layer_id: id,
            source_id,
        });
        Ok(())
    }

    /// Bind a layer's luminance matte, releasing the previous one.
    pub async fn bind_matte(
        &mut self,
        id: LayerId,
        source: Box<dyn MediaSource>,
    ) -> LockstepResult<()> {
        self.validate_source(id, SourceRole::Matte, source.as_ref())?;

        let slot = SourceSlot::new(source);
        let source_id = slot.id().clone();
        let previous = self.require_layer_mut(id)?.matte.replace(slot);
        if let Some(previous) = previous {
            if previous.id() != &source_id {
                self.descriptors.remove(previous.id());
            }
            previous.release().await;
        }

        tracing::info!(layer = %id, source = %source_id, "Matte bound");
        self.emit(CompositionEvent::MatteBound {
            layer_id: id,
            source_id,
        });
        Ok(())
    }

    pub async fn clear_media(&mut self, id: LayerId) -> LockstepResult<()> {
        if self.master == Some(id) {
            return Err(LockstepError::master_layer(format!(
                "{id} is the master layer; clear the master before removing its media"
            )));
        }
        if let Some(previous) = self.require_layer_mut(id)?.media.take() {
            let old_id = previous.id().clone();
            previous.release().await;
            self.descriptors.remove(&old_id);
            self.sync_send(|h| h.remove(old_id));
            self.emit(CompositionEvent::LayerChanged(id));
        }
        Ok(())
    }

    pub async fn clear_matte(&mut self, id: LayerId) -> LockstepResult<()> {
        if let Some(previous) = self.require_layer_mut(id)?.matte.take() {
            self.descriptors.remove(previous.id());
            previous.release().await;
            self.emit(CompositionEvent::LayerChanged(id));
        }
        Ok(())
    }

    /// Layer whose media (or matte) has the given source id.
    pub fn layer_for_source(&self, source_id: &SourceId) -> Option<(LayerId, SourceRole)> {
        self.layers.iter().find_map(|layer| {
            if layer.media().is_some_and(|s| s.id() == source_id) {
                Some((layer.id(), SourceRole::Media))
            } else if layer.matte().is_some_and(|s| s.id() == source_id) {
                Some((layer.id(), SourceRole::Matte))
            } else {
                None
            }
        })
    }

    /// Every bound source, media and mattes alike.
    pub fn slots(&self) -> impl Iterator<Item = &SourceSlot> {
        self.layers
            .iter()
            .flat_map(|layer| layer.media().into_iter().chain(layer.matte()))
    }

    // ---- master ----------------------------------------------------------

    pub fn master_layer(&self) -> Option<LayerId> {
        self.master
    }

    fn master_source_id(&self) -> Option<SourceId> {
        let master = self.layer(self.master?)?;
        master.media().map(|s| s.id().clone())
    }

    /// Make `id` the master clock. The layer must have media bound.
    pub fn set_master_layer(&mut self, id: LayerId) -> LockstepResult<()> {
        let layer = self
            .layer(id)
            .ok_or(LockstepError::LayerNotFound { layer_id: id })?;
        let source_id = layer
            .media()
            .map(|s| s.id().clone())
            .ok_or_else(|| LockstepError::master_layer(format!("{id} has no media bound")))?;

        self.master = Some(id);
        self.sync_send(|h| h.set_master(source_id.clone()));
        tracing::info!(layer = %id, source = %source_id, "Master layer set");
        self.emit(CompositionEvent::MasterChanged(Some(id)));
        Ok(())
    }

    pub fn clear_master(&mut self) {
        if self.master.take().is_some() {
            self.sync_send(|h| h.clear_master());
            self.emit(CompositionEvent::MasterChanged(None));
        }
    }

    // ---- timing ------------------------------------------------------------

    /// Manual duration override, or the media durations.
    pub fn duration(&self) -> f64 {
        if let Some(duration) = self.duration_override {
            return duration;
        }
        if let Some(main) = self.main_layer().and_then(|l| l.media()) {
            return main.source().duration();
        }
        self.layers
            .iter()
            .filter_map(|l| {
                l.media()
                    .map(|m| l.composition_time_of(m.source().duration()))
            })
            .fold(0.0, f64::max)
    }

    pub fn duration_override(&self) -> Option<f64> {
        self.duration_override
    }

    pub fn set_duration_override(&mut self, duration: Option<f64>) -> LockstepResult<()> {
        if let Some(d) = duration {
            if !(d > 0.0 && d.is_finite()) {
                return Err(LockstepError::composition(format!(
                    "duration must be positive, got {d}"
                )));
            }
        }
        self.duration_override = duration;
        Ok(())
    }

    /// Number of frames an export of this composition contains.
    pub fn total_frames(&self) -> u64 {
        (self.duration() * self.frame_rate + 1e-9).floor().max(0.0) as u64
    }

    pub fn time_at(&self, secs: f64) -> CompositionTime {
        CompositionTime::new(secs, self.frame_rate)
    }

    pub fn is_playing(&self) -> bool {
        self.transport.playing
    }

    /// Bumped by every play, pause, seek and transport restore.
    pub fn transport_epoch(&self) -> u64 {
        self.transport_epoch
    }

    /// Current composition time: the master's position when there is one,
    /// otherwise the composition's own transport clock.
    pub fn current_time(&self) -> f64 {
        if let Some(master) = self.master.and_then(|id| self.layer(id)) {
            if let Some(media) = master.media() {
                return master.composition_time_of(media.source().current_time());
            }
        }
        if self.transport.playing {
            self.transport.anchor_secs + (self.clock.now_secs() - self.transport.anchor_wall)
        } else {
            self.transport.anchor_secs
        }
    }

    /// Layers drawn at `secs`, in paint order (z ascending, insertion order on ties).
    pub fn active_layers(&self, secs: f64) -> Vec<&Layer> {
        let at = self.time_at(secs);
        let duration = self.duration();
        let mut active: Vec<&Layer> = self
            .layers
            .iter()
            .filter(|l| l.is_active(at, duration))
            .collect();
        active.sort_by_key(|l| l.z_index);
        active
    }

    pub fn active_layer_ids(&self, secs: f64) -> Vec<LayerId> {
        self.active_layers(secs).iter().map(|l| l.id()).collect()
    }

    // ---- transport ------------------------------------------------------------

    fn report_source_error(&self, source_id: &SourceId, op: &str, error: &LockstepError) {
        tracing::warn!(source = %source_id, op, error = %error, "Source operation failed");
        self.emit(CompositionEvent::SourceError {
            source_id: source_id.clone(),
            message: format!("{op}: {error}"),
        });
    }

    /// Start every source. Individual source failures are reported, not fatal.
    pub async fn play(&mut self) -> LockstepResult<()> {
        let time = self.current_time();
        let mut failures = Vec::new();
        for layer in &mut self.layers {
            for slot in layer.media.iter_mut().chain(layer.matte.iter_mut()) {
                if let Err(e) = slot.play().await {
                    failures.push((slot.id().clone(), e));
                }
            }
        }
        for (source_id, e) in &failures {
            self.report_source_error(source_id, "play", e);
        }

        self.transport = Transport {
            playing: true,
            anchor_secs: time,
            anchor_wall: self.clock.now_secs(),
        };
        self.transport_epoch += 1;
        self.sync_send(|h| h.play(time));
        self.emit(CompositionEvent::Played { time_secs: time });
        Ok(())
    }

    pub async fn pause(&mut self) -> LockstepResult<()> {
        let time = self.current_time();
        let mut failures = Vec::new();
        for layer in &mut self.layers {
            for slot in layer.media.iter_mut().chain(layer.matte.iter_mut()) {
                if let Err(e) = slot.pause().await {
                    failures.push((slot.id().clone(), e));
                }
            }
        }
        for (source_id, e) in &failures {
            self.report_source_error(source_id, "pause", e);
        }

        self.transport = Transport {
            playing: false,
            anchor_secs: time,
            anchor_wall: self.clock.now_secs(),
        };
        self.transport_epoch += 1;
        self.sync_send(|h| h.pause());
        self.emit(CompositionEvent::Paused { time_secs: time });
        Ok(())
    }

    /// Seek every source to its media time for `secs`, clamped to the
    /// composition. Returns the clamped time.
    pub async fn seek(&mut self, secs: f64) -> LockstepResult<f64> {
        let time = secs.clamp(0.0, self.duration().max(0.0));
        let mut failures = Vec::new();
        for layer in &mut self.layers {
            let media_time = layer.media_time_at(time);
            for slot in layer.media.iter_mut().chain(layer.matte.iter_mut()) {
                if let Err(e) = slot.seek(media_time).await {
                    failures.push((slot.id().clone(), e));
                }
            }
        }
        for (source_id, e) in &failures {
            self.report_source_error(source_id, "seek", e);
        }

        self.transport.anchor_secs = time;
        self.transport.anchor_wall = self.clock.now_secs();
        self.transport_epoch += 1;
        self.sync_send(|h| h.seek(time));
        self.emit(CompositionEvent::Seeked { time_secs: time });
        Ok(time)
    }

    /// Capture composition and per-source transport state.
    pub fn capture_transport(&self) -> TransportSnapshot {
        TransportSnapshot {
            time_secs: self.current_time(),
            playing: self.transport.playing,
            sources: self.slots().map(|s| s.snapshot()).collect(),
        }
    }

    /// Put every captured source back. All sources are attempted; the
    /// first failure is returned.
    pub async fn restore_transport(&mut self, snapshot: &TransportSnapshot) -> LockstepResult<()> {
        let mut first_error = None;
        for layer in &mut self.layers {
            for slot in layer.media.iter_mut().chain(layer.matte.iter_mut()) {
                let Some(saved) = snapshot.sources.iter().find(|s| &s.source_id == slot.id())
                else {
                    continue;
                };
                if let Err(e) = slot.restore(saved).await {
                    tracing::warn!(source = %slot.id(), error = %e, "Failed to restore source");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.transport = Transport {
            playing: snapshot.playing,
            anchor_secs: snapshot.time_secs,
            anchor_wall: self.clock.now_secs(),
        };
        self.transport_epoch += 1;
        if snapshot.playing {
            self.sync_send(|h| h.play(snapshot.time_secs));
        } else {
            self.sync_send(|h| h.seek(snapshot.time_secs));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release every source, e.g. on shutdown.
    pub async fn release_all(&mut self) {
        self.master = None;
        self.descriptors.clear();
        for layer in &mut self.layers {
            if let Some(media) = layer.media.take() {
                let source_id = media.id().clone();
                media.release().await;
                if let Some(handle) = &self.sync {
                    handle.remove(source_id).ok();
                }
            }
            if let Some(matte) = layer.matte.take() {
                matte.release().await;
            }
        }
    }
}
