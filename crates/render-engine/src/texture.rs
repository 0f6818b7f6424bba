//! Texture unit bookkeeping: one slot per (layer, role), never shared.

use std::collections::BTreeMap;

use lockstep_common::LayerId;

/// What a texture slot holds for its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TextureRole {
    Color,
    Matte,
}

/// A texture unit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureSlot(pub u32);

/// Allocates texture units to (layer, role) pairs.
#[derive(Debug, Clone)]
pub struct TextureSlots {
    capacity: u32,
    assigned: BTreeMap<(LayerId, TextureRole), TextureSlot>,
    free: Vec<u32>,
}

impl TextureSlots {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            assigned: BTreeMap::new(),
            // Lowest unit first.
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.assigned.len()
    }

    pub fn get(&self, layer: LayerId, role: TextureRole) -> Option<TextureSlot> {
        self.assigned.get(&(layer, role)).copied()
    }

    /// The slot already held by `(layer, role)`, or a fresh one. `None`
    /// when every unit is taken.
    pub fn acquire(&mut self, layer: LayerId, role: TextureRole) -> Option<TextureSlot> {
        if let Some(slot) = self.get(layer, role) {
            return Some(slot);
        }
        let slot = TextureSlot(self.free.pop()?);
        self.assigned.insert((layer, role), slot);
        Some(slot)
    }

    pub fn release(&mut self, layer: LayerId, role: TextureRole) -> Option<TextureSlot> {
        let slot = self.assigned.remove(&(layer, role))?;
        self.free.push(slot.0);
        Some(slot)
    }

    /// Free every slot held by `layer`.
    pub fn release_layer(&mut self, layer: LayerId) -> Vec<TextureSlot> {
        [TextureRole::Color, TextureRole::Matte]
            .into_iter()
            .filter_map(|role| self.release(layer, role))
            .collect()
    }

    /// Layers currently holding a slot.
    pub fn layers(&self) -> Vec<LayerId> {
        let mut layers: Vec<LayerId> = self.assigned.keys().map(|(id, _)| *id).collect();
        layers.dedup();
        layers
    }
}
