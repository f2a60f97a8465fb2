//! Core backend abstraction traits
//!
//! The graph only talks to the GPU through [`GpuBackend`]. Modules receive it as
//! `&mut dyn GpuBackend`, so the trait stays object safe.

use crate::backend::types::*;
use crate::sync::Barrier;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create binding table: {0}")]
    BindingTableCreationFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Wrap a backend-specific raw handle value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

define_handle!(
    /// Handle to a GPU image
    ImageHandle
);
define_handle!(
    /// Handle to a GPU buffer
    BufferHandle
);
define_handle!(
    /// Handle to a sampler
    SamplerHandle
);
define_handle!(
    /// Handle to a compute, graphics or ray tracing pipeline
    PipelineHandle
);
define_handle!(
    /// Handle to a resource-binding table
    BindingTableHandle
);

/// GPU backend used by the graph builder and by module contexts.
///
/// Creation methods are used while the graph is built, `cmd_*` methods while a
/// frame is recorded. Recording is single-threaded per frame-in-flight.
pub trait GpuBackend {
    /// Get backend name
    fn name(&self) -> &str;

    // Resource creation
    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;
    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;
    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;
    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;
    fn create_binding_table(
        &mut self,
        desc: &BindingTableDescriptor,
    ) -> BackendResult<BindingTableHandle>;
    fn update_binding_table(&mut self, table: BindingTableHandle, entries: &[BindingEntry]);

    // Resource destruction
    fn destroy_image(&mut self, image: ImageHandle);
    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn destroy_sampler(&mut self, sampler: SamplerHandle);
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);
    fn destroy_binding_table(&mut self, table: BindingTableHandle);

    // Command recording
    fn cmd_pipeline_barrier(&mut self, barriers: &[Barrier]);
    fn cmd_bind_pipeline(&mut self, pipeline: PipelineHandle);
    fn cmd_bind_binding_table(&mut self, pipeline: PipelineHandle, table: BindingTableHandle);
    fn cmd_push_constants(&mut self, pipeline: PipelineHandle, data: &[u8]);
    fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32);
    fn cmd_trace_rays(&mut self, width: u32, height: u32);
    fn cmd_fill_buffer(&mut self, buffer: BufferHandle, value: u32);
    fn cmd_begin_render_pass(&mut self, desc: &RenderPassDescriptor);
    fn cmd_draw(&mut self, vertex_count: u32, instance_count: u32);
    fn cmd_end_render_pass(&mut self);
}
