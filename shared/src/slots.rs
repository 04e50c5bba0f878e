//! Placement slots and their allocator.
//!
//! A slot keeps only a weak reference to its occupant. A departed
//! participant's occupant can outlive the departure until whoever still holds
//! it lets go, so a slot whose reference still resolves is not trusted as busy
//! until a liveness probe confirms something is actually standing there.

use crate::{check_overlap, Bounds, ParticipantId, SLOT_SIZE, SLOT_SPACING};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locality {
    /// The participant controlled from this process.
    Local,
    /// Everyone else.
    Remote,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Occupant {
    pub id: ParticipantId,
    pub locality: Locality,
}

impl Occupant {
    pub fn new(id: ParticipantId, locality: Locality) -> Arc<Self> {
        Arc::new(Self { id, locality })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("no free {0:?} slot for participant {1}")]
    NotFound(Locality, ParticipantId),
}

/// Decides whether a slot's area is really taken.
pub trait LivenessProbe {
    /// True if something other than `candidate` occupies `area`.
    fn is_blocked(&self, area: &Bounds, candidate: ParticipantId) -> bool;
}

/// Bodies currently present in the placement area.
#[derive(Debug, Default, Clone)]
pub struct Footprints {
    bodies: HashMap<ParticipantId, Bounds>,
}

impl Footprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place(&mut self, id: ParticipantId, bounds: Bounds) {
        self.bodies.insert(id, bounds);
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<Bounds> {
        self.bodies.remove(&id)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Bounds> {
        self.bodies.get(&id)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl LivenessProbe for Footprints {
    fn is_blocked(&self, area: &Bounds, candidate: ParticipantId) -> bool {
        self.bodies
            .iter()
            .any(|(id, bounds)| *id != candidate && check_overlap(area, bounds))
    }
}

#[derive(Debug, Clone)]
pub struct Slot {
    kind: Locality,
    footprint: Bounds,
    occupant: Option<Weak<Occupant>>,
}

impl Slot {
    pub fn new(kind: Locality, footprint: Bounds) -> Self {
        Self {
            kind,
            footprint,
            occupant: None,
        }
    }

    pub fn kind(&self) -> Locality {
        self.kind
    }

    pub fn footprint(&self) -> &Bounds {
        &self.footprint
    }

    /// The occupant, if the reference still resolves. A resolving reference
    /// may be stale.
    pub fn occupant(&self) -> Option<Arc<Occupant>> {
        self.occupant.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_vacant(&self) -> bool {
        self.occupant().is_none()
    }
}

/// Fixed pool of slots. Slots are never added or removed after construction;
/// only their occupant references change.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    slots: Vec<Slot>,
}

impl SlotAllocator {
    pub fn new(slots: Vec<Slot>) -> Self {
        Self { slots }
    }

    /// Lays out `local` slots followed by `remote` slots in a row, spaced so
    /// that neighbouring footprints never overlap.
    pub fn with_layout(local: usize, remote: usize) -> Self {
        let slots = (0..local)
            .map(|_| Locality::Local)
            .chain((0..remote).map(|_| Locality::Remote))
            .enumerate()
            .map(|(index, kind)| {
                Slot::new(kind, Bounds::square(index as f32 * SLOT_SPACING, 0.0, SLOT_SIZE))
            })
            .collect();
        Self::new(slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self, locality: Locality) -> usize {
        self.slots.iter().filter(|s| s.kind == locality).count()
    }

    pub fn free_count(&self, locality: Locality) -> usize {
        self.slots
            .iter()
            .filter(|s| s.kind == locality && s.is_vacant())
            .count()
    }

    pub fn slot(&self, slot: SlotId) -> Option<&Slot> {
        self.slots.get(slot)
    }

    pub fn slot_of(&self, id: ParticipantId) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.occupant().map_or(false, |o| o.id == id))
    }

    /// Claims a slot matching the occupant's locality.
    ///
    /// Empty slots are claimed directly. A slot whose occupant reference still
    /// resolves is reclaimed only if the probe finds nothing standing on it.
    pub fn acquire(
        &mut self,
        occupant: &Arc<Occupant>,
        probe: &dyn LivenessProbe,
    ) -> Result<SlotId, SlotError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.kind != occupant.locality {
                continue;
            }

            match slot.occupant() {
                None => {
                    slot.occupant = Some(Arc::downgrade(occupant));
                    return Ok(index);
                }
                Some(current) if current.id == occupant.id => {
                    slot.occupant = Some(Arc::downgrade(occupant));
                    return Ok(index);
                }
                Some(current) => {
                    if !probe.is_blocked(&slot.footprint, occupant.id) {
                        debug!(
                            "Reclaiming slot {} from stale occupant {} for participant {}",
                            index, current.id, occupant.id
                        );
                        slot.occupant = Some(Arc::downgrade(occupant));
                        return Ok(index);
                    }
                }
            }
        }

        warn!(
            "No {:?} slot found for participant {}; the slot pool is smaller than the participant limit",
            occupant.locality, occupant.id
        );
        Err(SlotError::NotFound(occupant.locality, occupant.id))
    }

    /// Clears a slot's occupant reference. Returns false for an unknown slot.
    pub fn release(&mut self, slot: SlotId) -> bool {
        match self.slots.get_mut(slot) {
            Some(slot) => {
                slot.occupant = None;
                true
            }
            None => false,
        }
    }

    pub fn release_occupant(&mut self, id: ParticipantId) -> Option<SlotId> {
        let slot = self.slot_of(id)?;
        self.release(slot);
        Some(slot)
    }
}
