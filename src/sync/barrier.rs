//! Barrier descriptions emitted by the state tracker.

use crate::backend::{BufferHandle, ImageHandle};
use crate::sync::state::{ImageLayout, ResourceState};

/// Any resource the tracker can carry a state tag for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    Image(ImageHandle),
    Buffer(BufferHandle),
}

impl From<ImageHandle> for ResourceId {
    fn from(handle: ImageHandle) -> Self {
        ResourceId::Image(handle)
    }
}

impl From<BufferHandle> for ResourceId {
    fn from(handle: BufferHandle) -> Self {
        ResourceId::Buffer(handle)
    }
}

impl From<crate::backend::Image> for ResourceId {
    fn from(image: crate::backend::Image) -> Self {
        ResourceId::Image(image.handle)
    }
}

/// A single memory/execution dependency with an optional layout change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Barrier {
    pub resource: ResourceId,
    pub src: ResourceState,
    pub dst: ResourceState,
}

impl Barrier {
    pub fn new(resource: impl Into<ResourceId>, src: ResourceState, dst: ResourceState) -> Self {
        Self {
            resource: resource.into(),
            src,
            dst,
        }
    }

    pub fn is_layout_transition(&self) -> bool {
        matches!(self.resource, ResourceId::Image(_)) && self.src.layout != self.dst.layout
    }

    /// Whether previous contents may be discarded by this transition.
    pub fn discards_contents(&self) -> bool {
        self.src.layout == ImageLayout::Undefined
    }
}

/// Decide whether moving a resource from `current` to `required` needs a barrier.
///
/// Differing states always do. Identical states only do when they include a
/// write, since the pending write still has to be made visible.
pub fn needs_barrier(current: &ResourceState, required: &ResourceState) -> bool {
    current != required || current.is_write()
}
