//! Shared resource table
//!
//! One owning arena of slot images, keyed by `(slot, frame)`. Modules only
//! ever see copies of the non-owning [`Image`] views stored here.

use crate::backend::Image;
use crate::render_graph::Slot;
use crate::FrameIndex;

/// Slot images for every frame in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResourceTable {
    frames_in_flight: usize,
    slot_count: usize,
    entries: Vec<Option<Image>>,
}

impl SharedResourceTable {
    pub fn new(frames_in_flight: usize, slot_count: usize) -> Self {
        Self {
            frames_in_flight,
            slot_count,
            entries: vec![None; frames_in_flight * slot_count],
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn index(&self, slot: Slot, frame: FrameIndex) -> Option<usize> {
        (slot.index() < self.slot_count && frame < self.frames_in_flight)
            .then(|| frame * self.slot_count + slot.index())
    }

    /// Image bound to `slot` for `frame`, if any.
    pub fn get(&self, slot: Slot, frame: FrameIndex) -> Option<Image> {
        self.index(slot, frame).and_then(|index| self.entries[index])
    }

    /// Bind `image` to `slot` for `frame`, returning the previous binding.
    pub fn set(&mut self, slot: Slot, frame: FrameIndex, image: Image) -> Option<Image> {
        let index = self.index(slot, frame)?;
        self.entries[index].replace(image)
    }

    /// Images bound for `slots`, in order.
    pub fn gather(&self, slots: &[Slot], frame: FrameIndex) -> Vec<Option<Image>> {
        slots.iter().map(|slot| self.get(*slot, frame)).collect()
    }

    /// Every bound entry as `(frame, slot, image)`, frame-major.
    pub fn iter(&self) -> impl Iterator<Item = (FrameIndex, Slot, Image)> + '_ {
        let slot_count = self.slot_count.max(1);
        self.entries.iter().enumerate().filter_map(move |(index, entry)| {
            entry.map(|image| (index / slot_count, Slot((index % slot_count) as u32), image))
        })
    }

    /// Remove and return every bound image.
    pub fn drain(&mut self) -> Vec<Image> {
        self.entries.iter_mut().filter_map(Option::take).collect()
    }
}
