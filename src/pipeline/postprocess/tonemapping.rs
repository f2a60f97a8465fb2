//! Tone mapping with automatic exposure
//!
//! Three steps per frame:
//! 1. a compute pass bins the log2 luminance of the HDR input into a
//!    256-entry histogram,
//! 2. a single-workgroup pass turns the histogram into an exposure value,
//!    adapting towards it over time,
//! 3. a fullscreen triangle applies exposure, saturation and contrast into
//!    the output.

use std::sync::Arc;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::backend::*;
use crate::error::{PipelineResult, RenderAnomaly};
use crate::pipeline::postprocess::FULLSCREEN_VERTEX_SHADER;
use crate::pipeline::{bind_or_create, release_tables};
use crate::render_graph::*;
use crate::sync::{ResourceId, ResourceState};
use crate::FrameIndex;

pub const TONE_MAPPING_MODULE_NAME: &str = "tone_mapping";

pub const HISTOGRAM_BINS: u64 = 256;
const HISTOGRAM_WORKGROUP_SIZE: u32 = 16;
const LOG2_LUMINANCE_MIN: f32 = -12.0;
const LOG2_LUMINANCE_MAX: f32 = 8.0;
const LUMINANCE_EPSILON: f32 = 1e-6;
const LOW_PERCENTILE: f32 = 0.01;
const HIGH_PERCENTILE: f32 = 0.95;
const MIN_EXPOSURE: f32 = 1e-4;

/// Tunable tone mapping parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMappingSettings {
    pub middle_grey: f32,
    pub exposure_up_speed: f32,
    pub exposure_down_speed: f32,
    pub max_exposure: f32,
    pub dark_adapt_limit: f32,
    pub saturation: f32,
    pub contrast: f32,
}

impl Default for ToneMappingSettings {
    fn default() -> Self {
        Self {
            middle_grey: 0.10,
            exposure_up_speed: 3.0,
            exposure_down_speed: 1.5,
            max_exposure: 64.0,
            dark_adapt_limit: 0.2,
            saturation: 1.3,
            contrast: 1.2,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct HistogramConstants {
    log2_min: f32,
    log2_max: f32,
    epsilon: f32,
    _padding: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ExposureConstants {
    low_percentile: f32,
    high_percentile: f32,
    middle_grey: f32,
    delta_time: f32,
    exposure_up_speed: f32,
    exposure_down_speed: f32,
    min_exposure: f32,
    max_exposure: f32,
    dark_adapt_limit: f32,
    log2_min: f32,
    log2_max: f32,
    pixel_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ToneMapConstants {
    saturation: f32,
    contrast: f32,
    _padding: [f32; 2],
}

#[derive(Debug, Clone, Copy)]
struct ToneMappingPipelines {
    histogram: PipelineHandle,
    exposure: PipelineHandle,
    tone_map: PipelineHandle,
}

#[derive(Debug, Clone, Copy)]
struct ToneMappingTables {
    histogram: BindingTableHandle,
    exposure: BindingTableHandle,
    tone_map: BindingTableHandle,
}

#[derive(Debug, Clone, Default)]
struct ToneMappingFrame {
    input: Option<Image>,
    output: Option<Image>,
    histogram: Option<BufferHandle>,
    exposure: Option<BufferHandle>,
    tables: Option<ToneMappingTables>,
}

/// Tone mapping module: 1 input (HDR color), 1 output (display color).
pub struct ToneMappingModule {
    settings: ToneMappingSettings,
    frames: Vec<ToneMappingFrame>,
    pipelines: Option<ToneMappingPipelines>,
    sampler: Option<SamplerHandle>,
    /// When exposure last adapted, shared by every frame context.
    last_adaptation: Arc<Mutex<Option<Instant>>>,
    contexts: Vec<Box<dyn ModuleContext>>,
}

impl ToneMappingModule {
    pub fn new() -> Self {
        Self {
            settings: ToneMappingSettings::default(),
            frames: Vec::new(),
            pipelines: None,
            sampler: None,
            last_adaptation: Arc::new(Mutex::new(None)),
            contexts: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ToneMappingSettings {
        &self.settings
    }

    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(
            TONE_MAPPING_MODULE_NAME,
            || Box::new(ToneMappingModule::new()) as Box<dyn PipelineModule>,
            1,
            1,
        )
    }

    fn frame_mut(&mut self, frame: FrameIndex) -> &mut ToneMappingFrame {
        if self.frames.len() <= frame {
            self.frames.resize_with(frame + 1, ToneMappingFrame::default);
        }
        &mut self.frames[frame]
    }
}

impl Default for ToneMappingModule {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineModule for ToneMappingModule {
    fn name(&self) -> &str {
        TONE_MAPPING_MODULE_NAME
    }

    fn init(&mut self, device: &DeviceContext) {
        self.frames = vec![ToneMappingFrame::default(); device.frames_in_flight];
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
        if !bind_or_create(ctx, images, formats, output.extent, "tone mapping input", frame)? {
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
        const MODULE: &str = TONE_MAPPING_MODULE_NAME;
        for (key, value) in attributes {
            let Some(name) = attribute_name(MODULE, key) else {
                continue;
            };
            let settings = &mut self.settings;
            match name {
                "middle_grey" => settings.middle_grey = parse_attribute(MODULE, key, value)?,
                "exposure_up_speed" => settings.exposure_up_speed = parse_attribute(MODULE, key, value)?,
                "exposure_down_speed" => settings.exposure_down_speed = parse_attribute(MODULE, key, value)?,
                "max_exposure" => settings.max_exposure = parse_attribute(MODULE, key, value)?,
                "dark_adapt_limit" => settings.dark_adapt_limit = parse_attribute(MODULE, key, value)?,
                "saturation" => settings.saturation = parse_attribute(MODULE, key, value)?,
                "contrast" => settings.contrast = parse_attribute(MODULE, key, value)?,
                _ => log::debug!("tone_mapping: ignoring unknown attribute '{}'", key),
            }
        }
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> PipelineResult<()> {
        let Some(output_format) = self.frames.iter().find_map(|f| f.output).map(|o| o.format) else {
            return Ok(());
        };

        let sampler = ctx.backend().create_sampler(&SamplerDescriptor {
            label: Some("tone mapping sampler".into()),
            ..Default::default()
        })?;
        self.sampler = Some(sampler);

        let backend = ctx.backend();
        let histogram = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: "luminance histogram".into(),
            shader: LUMINANCE_HISTOGRAM_SHADER.into(),
            push_constant_size: std::mem::size_of::<HistogramConstants>() as u32,
        })?;
        let exposure = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: "auto exposure".into(),
            shader: AUTO_EXPOSURE_SHADER.into(),
            push_constant_size: std::mem::size_of::<ExposureConstants>() as u32,
        })?;
        let tone_map = backend.create_graphics_pipeline(&GraphicsPipelineDescriptor {
            label: "tone mapping".into(),
            vertex_shader: FULLSCREEN_VERTEX_SHADER.into(),
            fragment_shader: TONE_MAPPING_SHADER.into(),
            color_format: output_format,
            push_constant_size: std::mem::size_of::<ToneMapConstants>() as u32,
        })?;
        let pipelines = ToneMappingPipelines {
            histogram,
            exposure,
            tone_map,
        };
        self.pipelines = Some(pipelines);

        let mut contexts: Vec<Box<dyn ModuleContext>> = Vec::with_capacity(self.frames.len());
        for (index, frame) in self.frames.iter_mut().enumerate() {
            let (Some(input), Some(output)) = (frame.input, frame.output) else {
                continue;
            };

            let histogram = ctx.create_buffer(&BufferDescriptor {
                label: Some(format!("luminance histogram frame {}", index)),
                size: HISTOGRAM_BINS * std::mem::size_of::<u32>() as u64,
                usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            })?;
            frame.histogram = Some(histogram);
            let exposure = ctx.create_buffer(&BufferDescriptor {
                label: Some(format!("exposure frame {}", index)),
                size: std::mem::size_of::<f32>() as u64,
                usage: BufferUsage::STORAGE,
            })?;
            frame.exposure = Some(exposure);

            let sampled_input = BindingResource::SampledImage {
                image: input.handle,
                sampler,
            };
            let backend = ctx.backend();
            let tables = ToneMappingTables {
                histogram: backend.create_binding_table(&BindingTableDescriptor {
                    label: format!("luminance histogram frame {}", index),
                    entries: vec![
                        BindingEntry::new(0, sampled_input),
                        BindingEntry::new(1, BindingResource::StorageBuffer(histogram)),
                    ],
                })?,
                exposure: backend.create_binding_table(&BindingTableDescriptor {
                    label: format!("auto exposure frame {}", index),
                    entries: vec![
                        BindingEntry::new(0, BindingResource::StorageBuffer(histogram)),
                        BindingEntry::new(1, BindingResource::StorageBuffer(exposure)),
                    ],
                })?,
                tone_map: backend.create_binding_table(&BindingTableDescriptor {
                    label: format!("tone mapping frame {}", index),
                    entries: vec![
                        BindingEntry::new(0, sampled_input),
                        BindingEntry::new(1, BindingResource::StorageBuffer(exposure)),
                    ],
                })?,
            };
            frame.tables = Some(tables);

            contexts.push(Box::new(ToneMappingContext {
                input,
                output,
                histogram,
                exposure,
                pipelines,
                tables,
                settings: self.settings,
                last_adaptation: Arc::clone(&self.last_adaptation),
            }));
        }

        self.contexts = contexts;
        Ok(())
    }

    fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>> {
        std::mem::take(&mut self.contexts)
    }

    fn pre_close(&mut self) {
        *self.last_adaptation.lock() = None;
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        for frame in self.frames.drain(..) {
            if let Some(tables) = frame.tables {
                release_tables(backend, &[tables.histogram, tables.exposure, tables.tone_map]);
            }
            for buffer in frame.histogram.into_iter().chain(frame.exposure) {
                backend.destroy_buffer(buffer);
            }
        }
        if let Some(pipelines) = self.pipelines.take() {
            backend.destroy_pipeline(pipelines.histogram);
            backend.destroy_pipeline(pipelines.exposure);
            backend.destroy_pipeline(pipelines.tone_map);
        }
        if let Some(sampler) = self.sampler.take() {
            backend.destroy_sampler(sampler);
        }
    }
}

struct ToneMappingContext {
    input: Image,
    output: Image,
    histogram: BufferHandle,
    exposure: BufferHandle,
    pipelines: ToneMappingPipelines,
    tables: ToneMappingTables,
    settings: ToneMappingSettings,
    last_adaptation: Arc<Mutex<Option<Instant>>>,
}

impl ToneMappingContext {
    /// Seconds since the previous adaptation step of any frame.
    fn delta_time(&self) -> f32 {
        let now = Instant::now();
        self.last_adaptation
            .lock()
            .replace(now)
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32())
    }
}

impl ModuleContext for ToneMappingContext {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
        ctx.ensure_tracked(&[
            ResourceId::from(self.input),
            ResourceId::from(self.output),
            ResourceId::from(self.histogram),
            ResourceId::from(self.exposure),
        ])?;

        ctx.transition_all(&[
            (ResourceId::from(self.input), ResourceState::SHADER_READ),
            (ResourceId::from(self.histogram), ResourceState::BUFFER_TRANSFER_WRITE),
        ])?;
        ctx.backend().cmd_fill_buffer(self.histogram, 0);

        ctx.transition(self.histogram, ResourceState::BUFFER_COMPUTE_READ_WRITE)?;
        let constants = HistogramConstants {
            log2_min: LOG2_LUMINANCE_MIN,
            log2_max: LOG2_LUMINANCE_MAX,
            epsilon: LUMINANCE_EPSILON,
            _padding: 0.0,
        };
        let (x, y) = self.input.extent.workgroups(HISTOGRAM_WORKGROUP_SIZE);
        let backend = ctx.backend();
        backend.cmd_bind_pipeline(self.pipelines.histogram);
        backend.cmd_bind_binding_table(self.pipelines.histogram, self.tables.histogram);
        backend.cmd_push_constants(self.pipelines.histogram, bytemuck::bytes_of(&constants));
        backend.cmd_dispatch(x, y, 1);

        ctx.transition_all(&[
            (ResourceId::from(self.histogram), ResourceState::BUFFER_COMPUTE_READ),
            (ResourceId::from(self.exposure), ResourceState::BUFFER_COMPUTE_READ_WRITE),
        ])?;
        let constants = ExposureConstants {
            low_percentile: LOW_PERCENTILE,
            high_percentile: HIGH_PERCENTILE,
            middle_grey: self.settings.middle_grey,
            delta_time: self.delta_time(),
            exposure_up_speed: self.settings.exposure_up_speed,
            exposure_down_speed: self.settings.exposure_down_speed,
            min_exposure: MIN_EXPOSURE,
            max_exposure: self.settings.max_exposure,
            dark_adapt_limit: self.settings.dark_adapt_limit,
            log2_min: LOG2_LUMINANCE_MIN,
            log2_max: LOG2_LUMINANCE_MAX,
            pixel_count: self.input.extent.width * self.input.extent.height,
        };
        let backend = ctx.backend();
        backend.cmd_bind_pipeline(self.pipelines.exposure);
        backend.cmd_bind_binding_table(self.pipelines.exposure, self.tables.exposure);
        backend.cmd_push_constants(self.pipelines.exposure, bytemuck::bytes_of(&constants));
        backend.cmd_dispatch(1, 1, 1);

        ctx.transition_all(&[
            (ResourceId::from(self.exposure), ResourceState::BUFFER_FRAGMENT_READ),
            (ResourceId::from(self.output), ResourceState::COLOR_ATTACHMENT_WRITE),
        ])?;
        let constants = ToneMapConstants {
            saturation: self.settings.saturation,
            contrast: self.settings.contrast,
            _padding: [0.0; 2],
        };
        let backend = ctx.backend();
        backend.cmd_begin_render_pass(&RenderPassDescriptor {
            label: Some("tone mapping".into()),
            extent: self.output.extent,
            color_attachments: vec![ColorAttachment {
                image: self.output.handle,
                load_op: LoadOp::DontCare,
                store: true,
            }],
        });
        backend.cmd_bind_pipeline(self.pipelines.tone_map);
        backend.cmd_bind_binding_table(self.pipelines.tone_map, self.tables.tone_map);
        backend.cmd_push_constants(self.pipelines.tone_map, bytemuck::bytes_of(&constants));
        backend.cmd_draw(3, 1);
        backend.cmd_end_render_pass();

        ctx.transition(self.output.handle, ResourceState::SHADER_READ)
    }
}

pub const LUMINANCE_HISTOGRAM_SHADER: &str = r#"
struct Params {
    log2_min: f32,
    log2_max: f32,
    epsilon: f32,
}

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;
@group(0) @binding(1) var<storage, read_write> histogram: array<atomic<u32>, 256>;
var<push_constant> params: Params;
var<workgroup> local_bins: array<atomic<u32>, 256>;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(local_invocation_index) local: u32) {
    atomicStore(&local_bins[local], 0u);
    workgroupBarrier();

    let size = textureDimensions(hdr_texture);
    if (id.x < size.x && id.y < size.y) {
        let color = textureLoad(hdr_texture, vec2<i32>(id.xy), 0).rgb;
        let luminance = dot(color, vec3<f32>(0.2126, 0.7152, 0.0722));
        var bin = 0u;
        if (luminance > params.epsilon) {
            let t = clamp((log2(luminance) - params.log2_min) / (params.log2_max - params.log2_min), 0.0, 1.0);
            bin = u32(t * 254.0 + 1.0);
        }
        atomicAdd(&local_bins[bin], 1u);
    }
    workgroupBarrier();

    atomicAdd(&histogram[local], atomicLoad(&local_bins[local]));
}
"#;

pub const AUTO_EXPOSURE_SHADER: &str = r#"
struct Params {
    low_percentile: f32,
    high_percentile: f32,
    middle_grey: f32,
    delta_time: f32,
    exposure_up_speed: f32,
    exposure_down_speed: f32,
    min_exposure: f32,
    max_exposure: f32,
    dark_adapt_limit: f32,
    log2_min: f32,
    log2_max: f32,
    pixel_count: u32,
}

@group(0) @binding(0) var<storage, read> histogram: array<u32, 256>;
@group(0) @binding(1) var<storage, read_write> exposure: f32;
var<push_constant> params: Params;

@compute @workgroup_size(1)
fn main() {
    let counted = f32(params.pixel_count - histogram[0]);
    let low = counted * params.low_percentile;
    let high = counted * params.high_percentile;

    var seen = 0.0;
    var weighted = 0.0;
    var weight = 0.0;
    for (var bin = 1u; bin < 256u; bin = bin + 1u) {
        let count = f32(histogram[bin]);
        let kept = clamp(seen + count, low, high) - clamp(seen, low, high);
        let log2_luminance = mix(params.log2_min, params.log2_max, (f32(bin) - 1.0) / 254.0);
        weighted = weighted + kept * log2_luminance;
        weight = weight + kept;
        seen = seen + count;
    }

    let average = exp2(weighted / max(weight, 1.0));
    let target_luminance = max(average, params.dark_adapt_limit * params.middle_grey);
    let target = clamp(params.middle_grey / target_luminance, params.min_exposure, params.max_exposure);

    var current = exposure;
    if (current <= 0.0) {
        current = target;
    }
    var speed = params.exposure_down_speed;
    if (target > current) {
        speed = params.exposure_up_speed;
    }
    exposure = current + (target - current) * (1.0 - exp(-params.delta_time * speed));
}
"#;

pub const TONE_MAPPING_SHADER: &str = r#"
struct Params {
    saturation: f32,
    contrast: f32,
}

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;
@group(0) @binding(1) var<storage, read> exposure: f32;
@group(1) @binding(0) var hdr_sampler: sampler;
var<push_constant> params: Params;

fn aces(x: vec3<f32>) -> vec3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    return clamp((x * (a * x + b)) / (x * (c * x + d) + e), vec3<f32>(0.0), vec3<f32>(1.0));
}

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let hdr = textureSample(hdr_texture, hdr_sampler, uv).rgb * exposure;
    let luminance = dot(hdr, vec3<f32>(0.2126, 0.7152, 0.0722));
    let saturated = mix(vec3<f32>(luminance), hdr, params.saturation);
    let mapped = aces(saturated);
    let contrasted = clamp((mapped - 0.5) * params.contrast + 0.5, vec3<f32>(0.0), vec3<f32>(1.0));
    return vec4<f32>(contrasted, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ToneMappingSettings::default();
        assert_eq!(settings.middle_grey, 0.10);
        assert_eq!(settings.max_exposure, 64.0);
        assert_eq!(settings.contrast, 1.2);
    }

    #[test]
    fn test_push_constant_layout() {
        assert_eq!(std::mem::size_of::<HistogramConstants>(), 16);
        assert_eq!(std::mem::size_of::<ExposureConstants>(), 48);
        assert_eq!(std::mem::size_of::<ToneMapConstants>(), 16);
    }

    #[test]
    fn test_attributes() {
        let mut module = ToneMappingModule::new();
        module
            .set_attributes(&[
                (attribute_key(TONE_MAPPING_MODULE_NAME, "saturation"), "0.9".to_string()),
                (attribute_key(TONE_MAPPING_MODULE_NAME, "max_exposure"), "16".to_string()),
            ])
            .unwrap();
        assert_eq!(module.settings().saturation, 0.9);
        assert_eq!(module.settings().max_exposure, 16.0);
    }
}
