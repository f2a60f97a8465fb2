//! Temporal upscaler
//!
//! The only resolution-changing built-in module: its quality mode decides the
//! render scale of everything upstream of it. Inputs are color, motion
//! vectors and linear depth at render resolution; the output is at
//! presentation resolution.

use std::fmt;
use std::str::FromStr;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::backend::*;
use crate::error::{PipelineResult, RenderAnomaly};
use crate::pipeline::{bind_or_create, release_tables};
use crate::render_graph::*;
use crate::sync::{ResourceId, ResourceState};
use crate::FrameIndex;

pub const UPSCALER_MODULE_NAME: &str = "upscaler";

const WORKGROUP_SIZE: u32 = 8;

/// Upscaler quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QualityMode {
    /// Anti-aliasing only, no upscaling
    #[default]
    NativeAa,
    Quality,
    Balanced,
    Performance,
    UltraPerformance,
}

impl QualityMode {
    pub const ALL: [QualityMode; 5] = [
        QualityMode::NativeAa,
        QualityMode::Quality,
        QualityMode::Balanced,
        QualityMode::Performance,
        QualityMode::UltraPerformance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QualityMode::NativeAa => "native_aa",
            QualityMode::Quality => "quality",
            QualityMode::Balanced => "balanced",
            QualityMode::Performance => "performance",
            QualityMode::UltraPerformance => "ultra_performance",
        }
    }

    /// Render resolution relative to the presentation resolution.
    pub fn render_scale(&self) -> f32 {
        match self {
            QualityMode::NativeAa => 1.0,
            QualityMode::Quality => 1.0 / 1.5,
            QualityMode::Balanced => 1.0 / 1.7,
            QualityMode::Performance => 1.0 / 2.0,
            QualityMode::UltraPerformance => 1.0 / 3.0,
        }
    }
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts the preset name or its index `0`-`4`.
impl FromStr for QualityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(index) = s.parse::<usize>() {
            return QualityMode::ALL
                .get(index)
                .copied()
                .ok_or_else(|| format!("quality mode index {} out of range", index));
        }
        QualityMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown quality mode '{}'", s))
    }
}

/// Render scale of an upscaler configured with `attributes`.
///
/// Without a `quality_mode` attribute the upscaler runs at native
/// resolution. An unknown mode is an `InvalidAttribute` error, the same one
/// the module reports when it applies its attributes.
pub fn upscaler_render_scale(attributes: &Attributes) -> PipelineResult<f32> {
    let quality_mode = attributes
        .iter()
        .rev()
        .find(|(key, _)| attribute_name(UPSCALER_MODULE_NAME, key) == Some("quality_mode"));
    match quality_mode {
        Some((key, value)) => {
            parse_attribute::<QualityMode>(UPSCALER_MODULE_NAME, key, value).map(|mode| mode.render_scale())
        }
        None => Ok(QualityMode::default().render_scale()),
    }
}

/// Tunable upscaler parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpscalerSettings {
    pub quality_mode: QualityMode,
    pub sharpness: f32,
}

impl Default for UpscalerSettings {
    fn default() -> Self {
        Self {
            quality_mode: QualityMode::default(),
            sharpness: 0.5,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UpscalerConstants {
    render_size: Vec2,
    output_size: Vec2,
    sharpness: f32,
    _padding: [f32; 3],
}

#[derive(Debug, Clone, Default)]
struct UpscalerFrame {
    inputs: Vec<Image>,
    output: Option<Image>,
    table: Option<BindingTableHandle>,
}

/// Upscaler module: 3 inputs (color, motion vectors, depth), 1 output.
pub struct UpscalerModule {
    settings: UpscalerSettings,
    frames: Vec<UpscalerFrame>,
    pipeline: Option<PipelineHandle>,
    sampler: Option<SamplerHandle>,
    contexts: Vec<Box<dyn ModuleContext>>,
}

impl UpscalerModule {
    pub fn new() -> Self {
        Self {
            settings: UpscalerSettings::default(),
            frames: Vec::new(),
            pipeline: None,
            sampler: None,
            contexts: Vec::new(),
        }
    }

    pub fn settings(&self) -> &UpscalerSettings {
        &self.settings
    }

    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(
            UPSCALER_MODULE_NAME,
            || Box::new(UpscalerModule::new()) as Box<dyn PipelineModule>,
            3,
            1,
        )
        .with_render_scale(upscaler_render_scale)
    }

    fn frame_mut(&mut self, frame: FrameIndex) -> &mut UpscalerFrame {
        if self.frames.len() <= frame {
            self.frames.resize_with(frame + 1, UpscalerFrame::default);
        }
        &mut self.frames[frame]
    }
}

impl Default for UpscalerModule {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineModule for UpscalerModule {
    fn name(&self) -> &str {
        UPSCALER_MODULE_NAME
    }

    fn init(&mut self, device: &DeviceContext) {
        self.frames = vec![UpscalerFrame::default(); device.frames_in_flight];
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
        let extent = images
            .iter()
            .flatten()
            .map(|image| image.extent)
            .next()
            .unwrap_or(ctx.device().render_extent);
        if !extent.fits_within(output.extent) {
            log::error!(
                "upscaler: input extent {} exceeds output extent {}",
                extent,
                output.extent
            );
            return Ok(false);
        }
        if !bind_or_create(ctx, images, formats, extent, "upscaler input", frame)? {
            return Ok(false);
        }
        self.frame_mut(frame).inputs = images.iter().flatten().copied().collect();
        Ok(true)
    }

    fn set_or_create_output_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool> {
        let extent = images
            .first()
            .copied()
            .flatten()
            .map_or(ctx.device().presentation_extent, |image| image.extent);
        if !bind_or_create(ctx, images, formats, extent, "upscaler output", frame)? {
            return Ok(false);
        }
        self.frame_mut(frame).output = images[0];
        Ok(true)
    }

    fn set_attributes(&mut self, attributes: &Attributes) -> PipelineResult<()> {
        const MODULE: &str = UPSCALER_MODULE_NAME;
        for (key, value) in attributes {
            let Some(name) = attribute_name(MODULE, key) else {
                continue;
            };
            match name {
                "quality_mode" => self.settings.quality_mode = parse_attribute(MODULE, key, value)?,
                "sharpness" => self.settings.sharpness = parse_attribute(MODULE, key, value)?,
                _ => log::debug!("upscaler: ignoring unknown attribute '{}'", key),
            }
        }
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> PipelineResult<()> {
        let backend = ctx.backend();
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("upscaler sampler".into()),
            ..Default::default()
        })?;
        self.sampler = Some(sampler);
        let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: format!("upscaler ({})", self.settings.quality_mode),
            shader: "upscaler/upscale.comp".into(),
            push_constant_size: std::mem::size_of::<UpscalerConstants>() as u32,
        })?;
        self.pipeline = Some(pipeline);

        let mut contexts: Vec<Box<dyn ModuleContext>> = Vec::with_capacity(self.frames.len());
        for (index, frame) in self.frames.iter_mut().enumerate() {
            let Some(output) = frame.output else {
                continue;
            };
            let mut entries: Vec<BindingEntry> = frame
                .inputs
                .iter()
                .enumerate()
                .map(|(binding, image)| {
                    BindingEntry::new(
                        binding as u32,
                        BindingResource::SampledImage {
                            image: image.handle,
                            sampler,
                        },
                    )
                })
                .collect();
            entries.push(BindingEntry::new(
                entries.len() as u32,
                BindingResource::StorageImage(output.handle),
            ));
            let table = backend.create_binding_table(&BindingTableDescriptor {
                label: format!("upscaler frame {}", index),
                entries,
            })?;
            frame.table = Some(table);

            contexts.push(Box::new(UpscalerContext {
                inputs: frame.inputs.clone(),
                output,
                pipeline,
                table,
                sharpness: self.settings.sharpness,
            }));
        }

        log::debug!(
            "upscaler: {} mode, render {} -> present {}",
            self.settings.quality_mode,
            ctx.device().render_extent,
            ctx.device().presentation_extent
        );
        self.contexts = contexts;
        Ok(())
    }

    fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>> {
        std::mem::take(&mut self.contexts)
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        for frame in self.frames.drain(..) {
            release_tables(backend, frame.table.as_slice());
        }
        if let Some(pipeline) = self.pipeline.take() {
            backend.destroy_pipeline(pipeline);
        }
        if let Some(sampler) = self.sampler.take() {
            backend.destroy_sampler(sampler);
        }
    }
}

struct UpscalerContext {
    inputs: Vec<Image>,
    output: Image,
    pipeline: PipelineHandle,
    table: BindingTableHandle,
    sharpness: f32,
}

impl ModuleContext for UpscalerContext {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
        let Some(color) = self.inputs.first() else {
            return Err(RenderAnomaly::missing(UPSCALER_MODULE_NAME, "color input"));
        };
        let render_extent = color.extent;

        let mut batch: Vec<(ResourceId, ResourceState)> = self
            .inputs
            .iter()
            .map(|image| (ResourceId::from(*image), ResourceState::SHADER_READ))
            .collect();
        batch.push((self.output.into(), ResourceState::STORAGE_WRITE_COMPUTE));
        let resources: Vec<ResourceId> = batch.iter().map(|(id, _)| *id).collect();
        ctx.ensure_tracked(&resources)?;
        ctx.transition_all(&batch)?;

        let constants = UpscalerConstants {
            render_size: Vec2::new(render_extent.width as f32, render_extent.height as f32),
            output_size: Vec2::new(self.output.extent.width as f32, self.output.extent.height as f32),
            sharpness: self.sharpness,
            _padding: [0.0; 3],
        };
        let (x, y) = self.output.extent.workgroups(WORKGROUP_SIZE);
        let backend = ctx.backend();
        backend.cmd_bind_pipeline(self.pipeline);
        backend.cmd_bind_binding_table(self.pipeline, self.table);
        backend.cmd_push_constants(self.pipeline, bytemuck::bytes_of(&constants));
        backend.cmd_dispatch(x, y, 1);

        ctx.transition(self.output.handle, ResourceState::SHADER_READ)
    }
}
