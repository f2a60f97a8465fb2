//! Path-traced world rendering
//!
//! Produces the noisy HDR radiance plus the auxiliary buffers a denoiser or
//! temporal upscaler consumes. The module has no inputs; every output shares
//! one extent, normally the render resolution chosen by the allocator.

use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::backend::*;
use crate::error::{PipelineResult, RenderAnomaly};
use crate::pipeline::release_tables;
use crate::render_graph::*;
use crate::sync::{ResourceId, ResourceState};
use crate::FrameIndex;

pub const RAY_TRACING_MODULE_NAME: &str = "ray_tracing";

/// Output slots, in declaration order.
pub const RAY_TRACING_OUTPUTS: [&str; 6] = [
    "hdr noisy",
    "diffuse albedo",
    "specular albedo",
    "normal roughness",
    "motion vectors",
    "linear depth",
];

/// Binding of the scene texture array in every frame's binding table.
pub const TEXTURE_ARRAY_BINDING: u32 = RAY_TRACING_OUTPUTS.len() as u32;

/// Tunable ray tracing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayTracingSettings {
    pub num_ray_bounces: u32,
    pub use_jitter: bool,
    pub emission_multiplier: f32,
    pub ambient_light: f32,
}

impl Default for RayTracingSettings {
    fn default() -> Self {
        Self {
            num_ray_bounces: 4,
            use_jitter: true,
            emission_multiplier: 1.0,
            ambient_light: 0.03,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RayTracingConstants {
    num_ray_bounces: u32,
    use_jitter: u32,
    emission_multiplier: f32,
    ambient_light: f32,
    jitter: Vec2,
    frame_counter: u32,
    _padding: u32,
}

/// Element `index` of the Halton low-discrepancy sequence in `base`.
fn halton(mut index: u32, base: u32) -> f32 {
    let mut fraction = 1.0;
    let mut result = 0.0;
    while index > 0 {
        fraction /= base as f32;
        result += fraction * (index % base) as f32;
        index /= base;
    }
    result
}

/// Sub-pixel camera jitter for `frame_counter`, in `[-0.5, 0.5)`.
pub fn jitter_offset(frame_counter: u32) -> Vec2 {
    // Halton(2, 3) over a 16 frame cycle, starting at index 1
    let index = frame_counter % 16 + 1;
    Vec2::new(halton(index, 2) - 0.5, halton(index, 3) - 0.5)
}

/// Ray tracing module: no inputs, 6 outputs.
pub struct RayTracingModule {
    settings: RayTracingSettings,
    outputs: Vec<Vec<Image>>,
    pipeline: Option<PipelineHandle>,
    tables: Vec<BindingTableHandle>,
    textures: BTreeMap<u32, (SamplerHandle, ImageHandle)>,
    contexts: Vec<Box<dyn ModuleContext>>,
}

impl RayTracingModule {
    pub fn new() -> Self {
        Self {
            settings: RayTracingSettings::default(),
            outputs: Vec::new(),
            pipeline: None,
            tables: Vec::new(),
            textures: BTreeMap::new(),
            contexts: Vec::new(),
        }
    }

    pub fn settings(&self) -> &RayTracingSettings {
        &self.settings
    }

    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(
            RAY_TRACING_MODULE_NAME,
            || Box::new(RayTracingModule::new()) as Box<dyn PipelineModule>,
            0,
            RAY_TRACING_OUTPUTS.len(),
        )
    }

    fn texture_entry(index: u32, sampler: SamplerHandle, image: ImageHandle) -> BindingEntry {
        BindingEntry {
            binding: TEXTURE_ARRAY_BINDING,
            array_element: index,
            resource: BindingResource::SampledImage { image, sampler },
        }
    }
}

impl Default for RayTracingModule {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineModule for RayTracingModule {
    fn name(&self) -> &str {
        RAY_TRACING_MODULE_NAME
    }

    fn init(&mut self, device: &DeviceContext) {
        self.outputs = vec![Vec::new(); device.frames_in_flight];
    }

    fn set_or_create_input_images(
        &mut self,
        _ctx: &mut BuildContext<'_>,
        _images: &mut [Option<Image>],
        _formats: &[Format],
        _frame: FrameIndex,
    ) -> BackendResult<bool> {
        Ok(true)
    }

    /// Adopt the extent of the first bound output and create the rest at it.
    fn set_or_create_output_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool> {
        let Some(extent) = images.iter().flatten().map(|image| image.extent).next() else {
            log::error!("ray_tracing: no output is bound for frame {}, cannot pick a size", frame);
            return Ok(false);
        };
        if images.iter().flatten().any(|image| image.extent != extent) {
            return Ok(false);
        }

        for (index, (image, format)) in images.iter_mut().zip(formats).enumerate() {
            if image.is_none() {
                let label = RAY_TRACING_OUTPUTS.get(index).copied().unwrap_or("output");
                *image = Some(ctx.create_image(&ImageDescriptor::new(
                    format!("{} frame {}", label, frame),
                    extent,
                    *format,
                    ImageUsage::SHARED_SLOT,
                ))?);
            }
        }

        if self.outputs.len() <= frame {
            self.outputs.resize(frame + 1, Vec::new());
        }
        self.outputs[frame] = images.iter().flatten().copied().collect();
        Ok(true)
    }

    fn set_attributes(&mut self, attributes: &Attributes) -> PipelineResult<()> {
        const MODULE: &str = RAY_TRACING_MODULE_NAME;
        for (key, value) in attributes {
            let Some(name) = attribute_name(MODULE, key) else {
                continue;
            };
            match name {
                "num_ray_bounces" => self.settings.num_ray_bounces = parse_attribute(MODULE, key, value)?,
                "use_jitter" => self.settings.use_jitter = parse_bool_attribute(MODULE, key, value)?,
                "emission_multiplier" => self.settings.emission_multiplier = parse_attribute(MODULE, key, value)?,
                "ambient_light" => self.settings.ambient_light = parse_attribute(MODULE, key, value)?,
                _ => log::debug!("ray_tracing: ignoring unknown attribute '{}'", key),
            }
        }
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> PipelineResult<()> {
        let backend = ctx.backend();
        let pipeline = backend.create_ray_tracing_pipeline(&RayTracingPipelineDescriptor {
            label: "ray tracing".into(),
            raygen_shader: "ray_tracing/raygen.rgen".into(),
            miss_shaders: vec!["ray_tracing/miss.rmiss".into(), "ray_tracing/shadow.rmiss".into()],
            closest_hit_shader: "ray_tracing/closest_hit.rchit".into(),
            max_recursion_depth: self.settings.num_ray_bounces.max(1),
            push_constant_size: std::mem::size_of::<RayTracingConstants>() as u32,
        })?;
        self.pipeline = Some(pipeline);

        let mut contexts: Vec<Box<dyn ModuleContext>> = Vec::with_capacity(self.outputs.len());
        for (frame, outputs) in self.outputs.iter().enumerate() {
            let mut entries: Vec<BindingEntry> = outputs
                .iter()
                .enumerate()
                .map(|(binding, image)| BindingEntry::new(binding as u32, BindingResource::StorageImage(image.handle)))
                .collect();
            entries.extend(
                self.textures
                    .iter()
                    .map(|(index, (sampler, image))| Self::texture_entry(*index, *sampler, *image)),
            );
            let table = backend.create_binding_table(&BindingTableDescriptor {
                label: format!("ray tracing frame {}", frame),
                entries,
            })?;
            self.tables.push(table);

            contexts.push(Box::new(RayTracingContext {
                outputs: outputs.clone(),
                pipeline,
                table,
                settings: self.settings,
                frame_counter: 0,
            }));
        }

        self.contexts = contexts;
        Ok(())
    }

    fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>> {
        std::mem::take(&mut self.contexts)
    }

    fn bind_texture(&mut self, backend: &mut dyn GpuBackend, sampler: SamplerHandle, image: ImageHandle, index: u32) {
        self.textures.insert(index, (sampler, image));
        let entry = Self::texture_entry(index, sampler, image);
        for table in &self.tables {
            backend.update_binding_table(*table, &[entry]);
        }
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        release_tables(backend, &self.tables);
        self.tables.clear();
        if let Some(pipeline) = self.pipeline.take() {
            backend.destroy_pipeline(pipeline);
        }
        self.outputs.clear();
    }
}

struct RayTracingContext {
    outputs: Vec<Image>,
    pipeline: PipelineHandle,
    table: BindingTableHandle,
    settings: RayTracingSettings,
    frame_counter: u32,
}

impl ModuleContext for RayTracingContext {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
        let Some(extent) = self.outputs.first().map(|image| image.extent) else {
            return Err(RenderAnomaly::missing(RAY_TRACING_MODULE_NAME, "output image"));
        };
        let resources: Vec<ResourceId> = self.outputs.iter().map(|image| ResourceId::from(*image)).collect();
        ctx.ensure_tracked(&resources)?;

        let batch: Vec<_> = resources
            .iter()
            .map(|id| (*id, ResourceState::STORAGE_WRITE_RAY_TRACING))
            .collect();
        ctx.transition_all(&batch)?;

        let constants = RayTracingConstants {
            num_ray_bounces: self.settings.num_ray_bounces,
            use_jitter: u32::from(self.settings.use_jitter),
            emission_multiplier: self.settings.emission_multiplier,
            ambient_light: self.settings.ambient_light,
            jitter: if self.settings.use_jitter {
                jitter_offset(self.frame_counter)
            } else {
                Vec2::ZERO
            },
            frame_counter: self.frame_counter,
            _padding: 0,
        };
        self.frame_counter = self.frame_counter.wrapping_add(1);

        let backend = ctx.backend();
        backend.cmd_bind_pipeline(self.pipeline);
        backend.cmd_bind_binding_table(self.pipeline, self.table);
        backend.cmd_push_constants(self.pipeline, bytemuck::bytes_of(&constants));
        backend.cmd_trace_rays(extent.width, extent.height);

        let batch: Vec<_> = resources
            .iter()
            .map(|id| (*id, ResourceState::SHADER_READ))
            .collect();
        ctx.transition_all(&batch)
    }
}
