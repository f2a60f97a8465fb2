//! Recording GPU backend.
//!
//! This backend doesn't talk to a GPU. Every call is logged and appended to an
//! in-memory command list, which makes it the reference backend for tests and
//! for inspecting what a pipeline would submit.

use std::collections::HashMap;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::sync::{Barrier, ResourceId};

/// Kind of pipeline created through the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Compute,
    Graphics,
    RayTracing,
}

/// One call made against a [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    CreateImage {
        image: ImageHandle,
        desc: ImageDescriptor,
    },
    CreateBuffer {
        buffer: BufferHandle,
        desc: BufferDescriptor,
    },
    CreateSampler(SamplerHandle),
    CreatePipeline {
        pipeline: PipelineHandle,
        kind: PipelineKind,
        label: String,
    },
    CreateBindingTable {
        table: BindingTableHandle,
        label: String,
    },
    UpdateBindingTable {
        table: BindingTableHandle,
        entries: Vec<BindingEntry>,
    },
    DestroyImage(ImageHandle),
    DestroyBuffer(BufferHandle),
    DestroySampler(SamplerHandle),
    DestroyPipeline(PipelineHandle),
    DestroyBindingTable(BindingTableHandle),
    PipelineBarrier(Vec<Barrier>),
    BindPipeline(PipelineHandle),
    BindBindingTable {
        pipeline: PipelineHandle,
        table: BindingTableHandle,
    },
    PushConstants {
        pipeline: PipelineHandle,
        data: Vec<u8>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    TraceRays {
        width: u32,
        height: u32,
    },
    FillBuffer {
        buffer: BufferHandle,
        value: u32,
    },
    BeginRenderPass {
        label: Option<String>,
        extent: Extent2D,
        attachments: Vec<ImageHandle>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    EndRenderPass,
}

impl RecordedCommand {
    /// True for commands that execute shader or transfer work.
    pub fn is_gpu_work(&self) -> bool {
        matches!(
            self,
            RecordedCommand::Dispatch { .. }
                | RecordedCommand::TraceRays { .. }
                | RecordedCommand::FillBuffer { .. }
                | RecordedCommand::Draw { .. }
        )
    }
}

/// Backend that records instead of executing.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    next_handle: u64,
    commands: Vec<RecordedCommand>,
    images: HashMap<ImageHandle, ImageDescriptor>,
    buffers: HashMap<BufferHandle, BufferDescriptor>,
    samplers: HashMap<SamplerHandle, SamplerDescriptor>,
    pipelines: HashMap<PipelineHandle, PipelineKind>,
    binding_tables: HashMap<BindingTableHandle, Vec<BindingEntry>>,
    image_budget: Option<usize>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail image creation once `budget` images are alive. Used to exercise
    /// out-of-memory paths.
    pub fn set_image_budget(&mut self, budget: Option<usize>) {
        self.image_budget = budget;
    }

    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn record(&mut self, command: RecordedCommand) {
        self.commands.push(command);
    }

    /// Every command recorded so far
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Drain the recorded commands, keeping live resources
    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// All barriers recorded so far, flattened in recording order
    pub fn barriers(&self) -> Vec<Barrier> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::PipelineBarrier(batch) => Some(batch.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Barriers touching a single resource, in recording order
    pub fn barriers_for(&self, resource: impl Into<ResourceId>) -> Vec<Barrier> {
        let resource = resource.into();
        self.barriers()
            .into_iter()
            .filter(|barrier| barrier.resource == resource)
            .collect()
    }

    /// Workgroup counts of every dispatch recorded so far
    pub fn dispatches(&self) -> Vec<(u32, u32, u32)> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::Dispatch { x, y, z } => Some((*x, *y, *z)),
                _ => None,
            })
            .collect()
    }

    pub fn image_descriptor(&self, image: ImageHandle) -> Option<&ImageDescriptor> {
        self.images.get(&image)
    }

    pub fn binding_table_entries(&self, table: BindingTableHandle) -> Option<&[BindingEntry]> {
        self.binding_tables.get(&table).map(Vec::as_slice)
    }

    pub fn is_image_alive(&self, image: ImageHandle) -> bool {
        self.images.contains_key(&image)
    }

    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Total number of live GPU objects of any kind
    pub fn live_object_count(&self) -> usize {
        self.images.len()
            + self.buffers.len()
            + self.samplers.len()
            + self.pipelines.len()
            + self.binding_tables.len()
    }

    fn create_pipeline(&mut self, kind: PipelineKind, label: &str) -> PipelineHandle {
        let pipeline = PipelineHandle(self.allocate_handle());
        log::trace!("RecordingBackend: creating {:?} pipeline '{}'", kind, label);
        self.pipelines.insert(pipeline, kind);
        self.record(RecordedCommand::CreatePipeline {
            pipeline,
            kind,
            label: label.to_string(),
        });
        pipeline
    }
}

impl GpuBackend for RecordingBackend {
    fn name(&self) -> &str {
        "Recording Backend"
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        if desc.extent.is_empty() {
            return Err(BackendError::ImageCreationFailed(format!(
                "{:?} has an empty extent {}",
                desc.label, desc.extent
            )));
        }
        if let Some(budget) = self.image_budget {
            if self.images.len() >= budget {
                return Err(BackendError::OutOfMemory);
            }
        }

        let image = ImageHandle(self.allocate_handle());
        log::trace!(
            "RecordingBackend: creating image {:?} ({}, {})",
            desc.label,
            desc.extent,
            desc.format
        );
        self.images.insert(image, desc.clone());
        self.record(RecordedCommand::CreateImage {
            image,
            desc: desc.clone(),
        });
        Ok(image)
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?} has size 0",
                desc.label
            )));
        }

        let buffer = BufferHandle(self.allocate_handle());
        log::trace!(
            "RecordingBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        self.buffers.insert(buffer, desc.clone());
        self.record(RecordedCommand::CreateBuffer {
            buffer,
            desc: desc.clone(),
        });
        Ok(buffer)
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = SamplerHandle(self.allocate_handle());
        log::trace!("RecordingBackend: creating sampler {:?}", desc.label);
        self.samplers.insert(sampler, desc.clone());
        self.record(RecordedCommand::CreateSampler(sampler));
        Ok(sampler)
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        Ok(self.create_pipeline(PipelineKind::Compute, &desc.label))
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        Ok(self.create_pipeline(PipelineKind::Graphics, &desc.label))
    }

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        if desc.max_recursion_depth == 0 {
            return Err(BackendError::PipelineCreationFailed(format!(
                "'{}' needs a recursion depth of at least 1",
                desc.label
            )));
        }
        Ok(self.create_pipeline(PipelineKind::RayTracing, &desc.label))
    }

    fn create_binding_table(
        &mut self,
        desc: &BindingTableDescriptor,
    ) -> BackendResult<BindingTableHandle> {
        let table = BindingTableHandle(self.allocate_handle());
        log::trace!(
            "RecordingBackend: creating binding table '{}' ({} entries)",
            desc.label,
            desc.entries.len()
        );
        self.binding_tables.insert(table, desc.entries.clone());
        self.record(RecordedCommand::CreateBindingTable {
            table,
            label: desc.label.clone(),
        });
        Ok(table)
    }

    fn update_binding_table(&mut self, table: BindingTableHandle, entries: &[BindingEntry]) {
        let Some(bound) = self.binding_tables.get_mut(&table) else {
            log::warn!("RecordingBackend: update of unknown binding table {:?}", table);
            return;
        };
        for entry in entries {
            match bound
                .iter_mut()
                .find(|e| e.binding == entry.binding && e.array_element == entry.array_element)
            {
                Some(existing) => *existing = *entry,
                None => bound.push(*entry),
            }
        }
        self.record(RecordedCommand::UpdateBindingTable {
            table,
            entries: entries.to_vec(),
        });
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image).is_none() {
            log::warn!("RecordingBackend: destroying unknown image {:?}", image);
        }
        self.record(RecordedCommand::DestroyImage(image));
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_none() {
            log::warn!("RecordingBackend: destroying unknown buffer {:?}", buffer);
        }
        self.record(RecordedCommand::DestroyBuffer(buffer));
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if self.samplers.remove(&sampler).is_none() {
            log::warn!("RecordingBackend: destroying unknown sampler {:?}", sampler);
        }
        self.record(RecordedCommand::DestroySampler(sampler));
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(&pipeline).is_none() {
            log::warn!("RecordingBackend: destroying unknown pipeline {:?}", pipeline);
        }
        self.record(RecordedCommand::DestroyPipeline(pipeline));
    }

    fn destroy_binding_table(&mut self, table: BindingTableHandle) {
        if self.binding_tables.remove(&table).is_none() {
            log::warn!("RecordingBackend: destroying unknown binding table {:?}", table);
        }
        self.record(RecordedCommand::DestroyBindingTable(table));
    }

    fn cmd_pipeline_barrier(&mut self, barriers: &[Barrier]) {
        log::trace!("RecordingBackend: pipeline barrier ({} entries)", barriers.len());
        self.record(RecordedCommand::PipelineBarrier(barriers.to_vec()));
    }

    fn cmd_bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.record(RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_binding_table(&mut self, pipeline: PipelineHandle, table: BindingTableHandle) {
        self.record(RecordedCommand::BindBindingTable { pipeline, table });
    }

    fn cmd_push_constants(&mut self, pipeline: PipelineHandle, data: &[u8]) {
        self.record(RecordedCommand::PushConstants {
            pipeline,
            data: data.to_vec(),
        });
    }

    fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32) {
        log::trace!("RecordingBackend: dispatch ({}, {}, {})", x, y, z);
        self.record(RecordedCommand::Dispatch { x, y, z });
    }

    fn cmd_trace_rays(&mut self, width: u32, height: u32) {
        log::trace!("RecordingBackend: trace rays {}x{}", width, height);
        self.record(RecordedCommand::TraceRays { width, height });
    }

    fn cmd_fill_buffer(&mut self, buffer: BufferHandle, value: u32) {
        self.record(RecordedCommand::FillBuffer { buffer, value });
    }

    fn cmd_begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        log::trace!("RecordingBackend: begin render pass {:?}", desc.label);
        self.record(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
            extent: desc.extent,
            attachments: desc.color_attachments.iter().map(|a| a.image).collect(),
        });
    }

    fn cmd_draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.record(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn cmd_end_render_pass(&mut self) {
        self.record(RecordedCommand::EndRenderPass);
    }
}
