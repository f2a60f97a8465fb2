//! Render Pipeline - module-based render graph composition with GPU resource synchronization
//!
//! A renderer is described as a [`BlueprintDesc`](render_graph::BlueprintDesc):
//! an ordered list of named modules wired together through numbered image
//! slots. The crate validates the wiring, allocates the shared images once per
//! frame in flight, builds every module in reverse order so consumers can bind
//! the images they need before producers see them, and records frames while
//! tracking the state of every image and emitting the barriers between uses.
//!
//! # Features
//! - Blueprint validation against a registry of module descriptors
//! - Per-frame shared resource tables with render/presentation resolution tiers
//! - State tracking with automatic barrier emission
//! - Deferred destruction of retired resources keyed by frame in flight
//! - Built-in ray tracing, upscaling, bloom and tone mapping modules
//! - A recording backend for tests and a Vulkan barrier translation layer

pub mod backend;
pub mod deferred;
pub mod error;
pub mod pipeline;
pub mod render_graph;
pub mod sync;

pub use backend::{Extent2D, Format, GpuBackend, RecordingBackend};
pub use deferred::{DeferredCollector, Retire};
pub use error::{PipelineError, PipelineResult, RenderAnomaly};
pub use pipeline::Pipeline;
pub use render_graph::{Blueprint, BlueprintDesc, ModuleRegistry, ModuleSpec, Slot, WorldPipeline};

/// Index of a frame in flight, always taken modulo the configured count
pub type FrameIndex = usize;

/// Configuration for building world pipelines
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Number of frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Size of the presented image (slot 0)
    pub presentation_extent: Extent2D,
}

impl PipelineConfig {
    pub fn new(frames_in_flight: usize, presentation_extent: Extent2D) -> Self {
        Self {
            frames_in_flight,
            presentation_extent,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            presentation_extent: Extent2D::new(1280, 720),
        }
    }
}
