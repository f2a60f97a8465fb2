//! Bloom post-processing module
//!
//! A small compute sub-pipeline over a private mip chain:
//!
//! ```text
//!  input ─down(threshold)─► mip0 ─down─► mip1 ─ ... ─► mipN-1
//!                            ▲           │
//!                            └──up───────┘   (accumulate, smallest first)
//!  input + mip0 ─composite─► output
//! ```
//!
//! Every dispatch is followed by a barrier on the image it wrote, since the
//! next dispatch samples it.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::backend::*;
use crate::error::{PipelineResult, RenderAnomaly};
use crate::pipeline::{bind_or_create, release_tables};
use crate::render_graph::*;
use crate::sync::{ResourceId, ResourceState};
use crate::FrameIndex;

pub const BLOOM_MODULE_NAME: &str = "bloom";

/// Smallest side length the mip chain stops halving at.
pub const BLOOM_MIN_MIP_DIMENSION: u32 = 4;
pub const BLOOM_MAX_MIP_LEVELS: usize = 6;

const MIP_FORMAT: Format = Format::Rgba16Float;
const WORKGROUP_SIZE: u32 = 8;

/// Extents of the bloom mip chain below `extent`.
///
/// Halves the smaller side until it reaches `min_dimension` or `max_levels`
/// levels exist; always yields at least one level.
pub fn mip_chain_extents(extent: Extent2D, min_dimension: u32, max_levels: usize) -> Vec<Extent2D> {
    let mut count = 0;
    let mut dimension = extent.min_dimension();
    while dimension > min_dimension && count < max_levels {
        dimension /= 2;
        count += 1;
    }

    let mut extents = Vec::with_capacity(count.max(1));
    let mut current = extent;
    for _ in 0..count.max(1) {
        current = current.halved();
        extents.push(current);
    }
    extents
}

/// Tunable bloom parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomSettings {
    pub intensity: f32,
    pub threshold: f32,
    pub soft_knee: f32,
    pub radius: f32,
}

impl Default for BloomSettings {
    fn default() -> Self {
        Self {
            intensity: 0.3,
            threshold: 1.0,
            soft_knee: 0.5,
            radius: 1.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DownsampleConstants {
    src_texel_size: Vec2,
    threshold: f32,
    soft_knee: f32,
    apply_threshold: u32,
    _padding: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UpsampleConstants {
    src_texel_size: Vec2,
    radius: f32,
    _padding: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CompositeConstants {
    intensity: f32,
    _padding: [f32; 3],
}

fn texel_size(extent: Extent2D) -> Vec2 {
    Vec2::new(1.0 / extent.width as f32, 1.0 / extent.height as f32)
}

#[derive(Debug, Clone, Copy)]
struct BloomPipelines {
    downsample: PipelineHandle,
    upsample: PipelineHandle,
    composite: PipelineHandle,
}

/// Per-frame private objects
#[derive(Debug, Clone, Default)]
struct BloomFrame {
    input: Option<Image>,
    output: Option<Image>,
    mips: Vec<Image>,
    downsample_tables: Vec<BindingTableHandle>,
    upsample_tables: Vec<BindingTableHandle>,
    composite_table: Option<BindingTableHandle>,
}

/// Bloom module: 1 input (HDR color), 1 output (HDR color with bloom).
pub struct BloomModule {
    settings: BloomSettings,
    frames: Vec<BloomFrame>,
    pipelines: Option<BloomPipelines>,
    sampler: Option<SamplerHandle>,
    contexts: Vec<Box<dyn ModuleContext>>,
}

impl BloomModule {
    pub fn new() -> Self {
        Self {
            settings: BloomSettings::default(),
            frames: Vec::new(),
            pipelines: None,
            sampler: None,
            contexts: Vec::new(),
        }
    }

    pub fn settings(&self) -> &BloomSettings {
        &self.settings
    }

    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(BLOOM_MODULE_NAME, || Box::new(BloomModule::new()) as Box<dyn PipelineModule>, 1, 1)
    }

    fn frame_mut(&mut self, frame: FrameIndex) -> &mut BloomFrame {
        if self.frames.len() <= frame {
            self.frames.resize_with(frame + 1, BloomFrame::default);
        }
        &mut self.frames[frame]
    }

    fn create_pipelines(backend: &mut dyn GpuBackend) -> BackendResult<BloomPipelines> {
        let mut compute = |label: &str, shader: &str, push_constant_size: usize| {
            backend.create_compute_pipeline(&ComputePipelineDescriptor {
                label: label.to_string(),
                shader: shader.to_string(),
                push_constant_size: push_constant_size as u32,
            })
        };
        Ok(BloomPipelines {
            downsample: compute(
                "bloom downsample",
                BLOOM_DOWNSAMPLE_SHADER,
                std::mem::size_of::<DownsampleConstants>(),
            )?,
            upsample: compute(
                "bloom upsample",
                BLOOM_UPSAMPLE_SHADER,
                std::mem::size_of::<UpsampleConstants>(),
            )?,
            composite: compute(
                "bloom composite",
                BLOOM_COMPOSITE_SHADER,
                std::mem::size_of::<CompositeConstants>(),
            )?,
        })
    }
}

impl Default for BloomModule {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineModule for BloomModule {
    fn name(&self) -> &str {
        BLOOM_MODULE_NAME
    }

    fn init(&mut self, device: &DeviceContext) {
        self.frames = vec![BloomFrame::default(); device.frames_in_flight];
    }

    fn set_or_create_input_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool> {
        let Some(output) = self.frame_mut(frame).output else {
            return Ok(false);
        };
        if !bind_or_create(ctx, images, formats, output.extent, "bloom input", frame)? {
            return Ok(false);
        }
        self.frame_mut(frame).input = images[0];
        Ok(true)
    }

    fn set_or_create_output_images(
        &mut self,
        _ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        _formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool> {
        match images.first().copied().flatten() {
            Some(output) => {
                self.frame_mut(frame).output = Some(output);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_attributes(&mut self, attributes: &Attributes) -> PipelineResult<()> {
        for (key, value) in attributes {
            let Some(name) = attribute_name(BLOOM_MODULE_NAME, key) else {
                continue;
            };
            match name {
                "intensity" => self.settings.intensity = parse_attribute(BLOOM_MODULE_NAME, key, value)?,
                "threshold" => self.settings.threshold = parse_attribute(BLOOM_MODULE_NAME, key, value)?,
                "soft_knee" => self.settings.soft_knee = parse_attribute(BLOOM_MODULE_NAME, key, value)?,
                "radius" => self.settings.radius = parse_attribute(BLOOM_MODULE_NAME, key, value)?,
                _ => log::debug!("bloom: ignoring unknown attribute '{}'", key),
            }
        }
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> PipelineResult<()> {
        let sampler = ctx.backend().create_sampler(&SamplerDescriptor {
            label: Some("bloom sampler".into()),
            filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        })?;
        self.sampler = Some(sampler);
        let pipelines = Self::create_pipelines(ctx.backend())?;
        self.pipelines = Some(pipelines);

        let settings = self.settings;
        let mut contexts: Vec<Box<dyn ModuleContext>> = Vec::with_capacity(self.frames.len());
        for (index, frame) in self.frames.iter_mut().enumerate() {
            let (Some(input), Some(output)) = (frame.input, frame.output) else {
                continue;
            };

            for (level, extent) in mip_chain_extents(input.extent, BLOOM_MIN_MIP_DIMENSION, BLOOM_MAX_MIP_LEVELS)
                .into_iter()
                .enumerate()
            {
                frame.mips.push(ctx.create_image(&ImageDescriptor::new(
                    format!("bloom mip {} frame {}", level, index),
                    extent,
                    MIP_FORMAT,
                    ImageUsage::STORAGE | ImageUsage::SAMPLED,
                ))?);
            }

            let sampled = |image: &Image| BindingResource::SampledImage {
                image: image.handle,
                sampler,
            };
            let mut table = |label: String, entries: Vec<BindingEntry>| {
                ctx.backend()
                    .create_binding_table(&BindingTableDescriptor { label, entries })
            };

            for (level, mip) in frame.mips.iter().enumerate() {
                let source = if level == 0 { &input } else { &frame.mips[level - 1] };
                let handle = table(
                    format!("bloom downsample {} frame {}", level, index),
                    vec![
                        BindingEntry::new(0, sampled(source)),
                        BindingEntry::new(1, BindingResource::StorageImage(mip.handle)),
                    ],
                )?;
                frame.downsample_tables.push(handle);
            }
            for level in 0..frame.mips.len().saturating_sub(1) {
                let handle = table(
                    format!("bloom upsample {} frame {}", level, index),
                    vec![
                        BindingEntry::new(0, sampled(&frame.mips[level + 1])),
                        BindingEntry::new(1, BindingResource::StorageImage(frame.mips[level].handle)),
                    ],
                )?;
                frame.upsample_tables.push(handle);
            }
            frame.composite_table = Some(table(
                format!("bloom composite frame {}", index),
                vec![
                    BindingEntry::new(0, sampled(&input)),
                    BindingEntry::new(1, sampled(&frame.mips[0])),
                    BindingEntry::new(2, BindingResource::StorageImage(output.handle)),
                ],
            )?);

            contexts.push(Box::new(BloomContext {
                input,
                output,
                mips: frame.mips.clone(),
                pipelines,
                downsample_tables: frame.downsample_tables.clone(),
                upsample_tables: frame.upsample_tables.clone(),
                composite_table: frame.composite_table,
                settings,
            }));
        }

        log::debug!(
            "bloom: built {} frame context(s) with {} mip level(s)",
            contexts.len(),
            self.frames.first().map_or(0, |f| f.mips.len())
        );
        self.contexts = contexts;
        Ok(())
    }

    fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>> {
        std::mem::take(&mut self.contexts)
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        for frame in self.frames.drain(..) {
            release_tables(backend, &frame.downsample_tables);
            release_tables(backend, &frame.upsample_tables);
            release_tables(backend, frame.composite_table.as_slice());
            for mip in frame.mips {
                backend.destroy_image(mip.handle);
            }
        }
        if let Some(pipelines) = self.pipelines.take() {
            backend.destroy_pipeline(pipelines.downsample);
            backend.destroy_pipeline(pipelines.upsample);
            backend.destroy_pipeline(pipelines.composite);
        }
        if let Some(sampler) = self.sampler.take() {
            backend.destroy_sampler(sampler);
        }
    }
}

struct BloomContext {
    input: Image,
    output: Image,
    mips: Vec<Image>,
    pipelines: BloomPipelines,
    downsample_tables: Vec<BindingTableHandle>,
    upsample_tables: Vec<BindingTableHandle>,
    composite_table: Option<BindingTableHandle>,
    settings: BloomSettings,
}

impl BloomContext {
    fn dispatch(
        ctx: &mut RenderContext<'_>,
        pipeline: PipelineHandle,
        table: BindingTableHandle,
        constants: &[u8],
        target: Extent2D,
    ) {
        let backend = ctx.backend();
        backend.cmd_bind_pipeline(pipeline);
        backend.cmd_bind_binding_table(pipeline, table);
        backend.cmd_push_constants(pipeline, constants);
        let (x, y) = target.workgroups(WORKGROUP_SIZE);
        backend.cmd_dispatch(x, y, 1);
    }
}

impl ModuleContext for BloomContext {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
        let composite_table = self
            .composite_table
            .ok_or_else(|| RenderAnomaly::missing(BLOOM_MODULE_NAME, "composite binding table"))?;
        let mut resources: Vec<ResourceId> = vec![self.input.into(), self.output.into()];
        resources.extend(self.mips.iter().map(|mip| ResourceId::from(*mip)));
        ctx.ensure_tracked(&resources)?;

        let mut batch: Vec<(ResourceId, ResourceState)> = vec![(self.input.into(), ResourceState::SHADER_READ)];
        batch.extend(
            self.mips
                .iter()
                .map(|mip| (ResourceId::from(*mip), ResourceState::STORAGE_WRITE_COMPUTE)),
        );
        ctx.transition_all(&batch)?;

        for (level, mip) in self.mips.iter().enumerate() {
            let source = if level == 0 {
                self.input.extent
            } else {
                self.mips[level - 1].extent
            };
            let constants = DownsampleConstants {
                src_texel_size: texel_size(source),
                threshold: self.settings.threshold,
                soft_knee: self.settings.soft_knee,
                apply_threshold: u32::from(level == 0),
                _padding: [0; 3],
            };
            Self::dispatch(
                ctx,
                self.pipelines.downsample,
                self.downsample_tables[level],
                bytemuck::bytes_of(&constants),
                mip.extent,
            );
            ctx.transition(mip.handle, ResourceState::STORAGE_READ_WRITE_COMPUTE)?;
        }

        for level in (0..self.mips.len().saturating_sub(1)).rev() {
            let constants = UpsampleConstants {
                src_texel_size: texel_size(self.mips[level + 1].extent),
                radius: self.settings.radius,
                _padding: 0.0,
            };
            Self::dispatch(
                ctx,
                self.pipelines.upsample,
                self.upsample_tables[level],
                bytemuck::bytes_of(&constants),
                self.mips[level].extent,
            );
            ctx.transition(self.mips[level].handle, ResourceState::STORAGE_READ_WRITE_COMPUTE)?;
        }

        ctx.transition_all(&[
            (ResourceId::from(self.mips[0]), ResourceState::SHADER_READ),
            (ResourceId::from(self.output), ResourceState::STORAGE_WRITE_COMPUTE),
        ])?;
        let constants = CompositeConstants {
            intensity: self.settings.intensity,
            _padding: [0.0; 3],
        };
        Self::dispatch(
            ctx,
            self.pipelines.composite,
            composite_table,
            bytemuck::bytes_of(&constants),
            self.output.extent,
        );
        ctx.transition(self.output.handle, ResourceState::SHADER_READ)
    }
}

pub const BLOOM_DOWNSAMPLE_SHADER: &str = r#"
struct Params {
    src_texel_size: vec2<f32>,
    threshold: f32,
    soft_knee: f32,
    apply_threshold: u32,
}

@group(0) @binding(0) var src_texture: texture_2d<f32>;
@group(0) @binding(1) var dst_texture: texture_storage_2d<rgba16float, write>;
@group(1) @binding(0) var src_sampler: sampler;
var<push_constant> params: Params;

fn soft_threshold(color: vec3<f32>) -> vec3<f32> {
    let brightness = max(color.r, max(color.g, color.b));
    let knee = params.threshold * params.soft_knee;
    var soft = clamp(brightness - params.threshold + knee, 0.0, 2.0 * knee);
    soft = soft * soft / (4.0 * knee + 0.0001);
    let weight = max(soft, brightness - params.threshold) / max(brightness, 0.0001);
    return color * weight;
}

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(dst_texture);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let uv = (vec2<f32>(id.xy) + 0.5) / vec2<f32>(size);
    let d = params.src_texel_size;
    var color = textureSampleLevel(src_texture, src_sampler, uv, 0.0).rgb * 0.5;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(-d.x, -d.y), 0.0).rgb * 0.125;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(d.x, -d.y), 0.0).rgb * 0.125;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(-d.x, d.y), 0.0).rgb * 0.125;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(d.x, d.y), 0.0).rgb * 0.125;
    if (params.apply_threshold != 0u) {
        color = soft_threshold(color);
    }
    textureStore(dst_texture, vec2<i32>(id.xy), vec4<f32>(color, 1.0));
}
"#;

pub const BLOOM_UPSAMPLE_SHADER: &str = r#"
struct Params {
    src_texel_size: vec2<f32>,
    radius: f32,
}

@group(0) @binding(0) var src_texture: texture_2d<f32>;
@group(0) @binding(1) var dst_texture: texture_storage_2d<rgba16float, read_write>;
@group(1) @binding(0) var src_sampler: sampler;
var<push_constant> params: Params;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(dst_texture);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let uv = (vec2<f32>(id.xy) + 0.5) / vec2<f32>(size);
    let d = params.src_texel_size * params.radius;
    var color = textureSampleLevel(src_texture, src_sampler, uv, 0.0).rgb * 4.0;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(-d.x, 0.0), 0.0).rgb * 2.0;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(d.x, 0.0), 0.0).rgb * 2.0;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(0.0, -d.y), 0.0).rgb * 2.0;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(0.0, d.y), 0.0).rgb * 2.0;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(-d.x, -d.y), 0.0).rgb;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(d.x, -d.y), 0.0).rgb;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(-d.x, d.y), 0.0).rgb;
    color += textureSampleLevel(src_texture, src_sampler, uv + vec2<f32>(d.x, d.y), 0.0).rgb;
    let current = textureLoad(dst_texture, vec2<i32>(id.xy)).rgb;
    textureStore(dst_texture, vec2<i32>(id.xy), vec4<f32>(current + color / 16.0, 1.0));
}
"#;

pub const BLOOM_COMPOSITE_SHADER: &str = r#"
struct Params {
    intensity: f32,
}

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;
@group(0) @binding(1) var bloom_texture: texture_2d<f32>;
@group(0) @binding(2) var out_texture: texture_storage_2d<rgba16float, write>;
@group(1) @binding(0) var linear_sampler: sampler;
var<push_constant> params: Params;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(out_texture);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let uv = (vec2<f32>(id.xy) + 0.5) / vec2<f32>(size);
    let hdr = textureSampleLevel(hdr_texture, linear_sampler, uv, 0.0);
    let bloom = textureSampleLevel(bloom_texture, linear_sampler, uv, 0.0).rgb;
    textureStore(out_texture, vec2<i32>(id.xy), vec4<f32>(hdr.rgb + bloom * params.intensity, hdr.a));
}
"#;
