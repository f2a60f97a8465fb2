//! Deferred release of replaced GPU resources.
//!
//! The GPU runs one or more frames behind the CPU, so a resource replaced by a
//! rebuild or a resize may still be referenced by work that has not finished.
//! Replaced resources are parked in the queue of the frame-in-flight index that
//! was current when they were replaced, and released the next time that index
//! comes around, after its fence has been waited on.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    DeferredCollector                      │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐                 │
//! │  │ Frame 0  │  │ Frame 1  │  │ Frame 2  │  ...            │
//! │  │ retired  │  │ retired  │  │ retired  │                 │
//! │  └──────────┘  └──────────┘  └──────────┘                 │
//! └───────────────────────────────────────────────────────────┘
//!
//! On replace during frame i:
//!   collect(i, old)          -> parked in queue i
//!
//! On frame boundary, after the fence of frame i signalled:
//!   release(i, backend)      -> queue i is drained and destroyed
//! ```
//!
//! Frames are submitted in order, so once the fence of index `i` has signalled
//! every earlier submission has completed as well. Frames recorded after the
//! replacement never saw the old resources.

use parking_lot::Mutex;

use crate::backend::{BindingTableHandle, BufferHandle, GpuBackend, ImageHandle, PipelineHandle, SamplerHandle};
use crate::FrameIndex;

/// Anything that can be handed to the collector.
pub trait Retire: Send {
    /// Destroy the GPU objects owned by `self`.
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend);
}

impl Retire for ImageHandle {
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend) {
        backend.destroy_image(*self);
    }
}

impl Retire for BufferHandle {
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend) {
        backend.destroy_buffer(*self);
    }
}

impl Retire for SamplerHandle {
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend) {
        backend.destroy_sampler(*self);
    }
}

impl Retire for PipelineHandle {
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend) {
        backend.destroy_pipeline(*self);
    }
}

impl Retire for BindingTableHandle {
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend) {
        backend.destroy_binding_table(*self);
    }
}

/// Ring of per-frame-in-flight release queues.
pub struct DeferredCollector {
    frame_queues: Vec<Mutex<Vec<Box<dyn Retire>>>>,
}

impl std::fmt::Debug for DeferredCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCollector")
            .field("frames_in_flight", &self.frame_queues.len())
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

impl DeferredCollector {
    /// Create a collector with one queue per frame in flight.
    pub fn new(frames_in_flight: usize) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            frame_queues: (0..frames_in_flight).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame_queues.len()
    }

    fn queue_index(&self, frame: FrameIndex) -> usize {
        frame % self.frame_queues.len()
    }

    /// Park `resource` until the queue of `frame` is released.
    pub fn collect(&self, frame: FrameIndex, resource: impl Retire + 'static) {
        self.collect_boxed(frame, Box::new(resource));
    }

    pub fn collect_boxed(&self, frame: FrameIndex, resource: Box<dyn Retire>) {
        let index = self.queue_index(frame);
        self.frame_queues[index].lock().push(resource);
    }

    /// Destroy everything parked under `frame`.
    ///
    /// Call this only after the fence guarding `frame` has been waited on.
    /// Returns the number of released entries.
    pub fn release(&self, frame: FrameIndex, backend: &mut dyn GpuBackend) -> usize {
        let index = self.queue_index(frame);
        let retired: Vec<_> = self.frame_queues[index].lock().drain(..).collect();
        let count = retired.len();
        for resource in retired {
            resource.retire(backend);
        }
        if count > 0 {
            log::debug!("Released {} deferred resource(s) for frame {}", count, index);
        }
        count
    }

    /// Destroy every parked resource regardless of frame.
    ///
    /// Only valid once the device is idle, e.g. at shutdown.
    pub fn flush_all(&self, backend: &mut dyn GpuBackend) -> usize {
        (0..self.frame_queues.len())
            .map(|frame| self.release(frame, backend))
            .sum()
    }

    /// Number of resources waiting in every queue.
    pub fn pending_count(&self) -> usize {
        self.frame_queues.iter().map(|q| q.lock().len()).sum()
    }

    /// Number of resources waiting in the queue of `frame`.
    pub fn pending_for(&self, frame: FrameIndex) -> usize {
        self.frame_queues[self.queue_index(frame)].lock().len()
    }
}
