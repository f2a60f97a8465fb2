//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use render_pipeline::backend::*;
use render_pipeline::error::{PipelineResult, RenderAnomaly, SlotDirection};
use render_pipeline::render_graph::*;
use render_pipeline::sync::ResourceState;
use render_pipeline::FrameIndex;

/// Ordered record of test module events, e.g. `build:m1`, `render:m2@0` or
/// `output:m1@0=ImageHandle(1)`.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Misbehaviour injected into a [`ProbeModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Every render step reports an anomaly.
    FailRender,
    /// Output resolution returns `false`.
    RejectOutputs,
    /// Input resolution returns `false`.
    RejectInputs,
    /// Neither creates nor binds anything, yet reports success.
    LeaveUnbound,
    /// Creates outputs in `Format::R32Uint` whatever the blueprint says.
    WrongFormat,
    /// Creates a fresh image for every input, even already bound ones.
    RebindInputs,
    /// Hands out one context more than there are frames in flight.
    ExtraContext,
}

/// Test module that binds or creates its slots at presentation resolution,
/// writes its outputs and reads its inputs.
pub struct ProbeModule {
    name: String,
    log: EventLog,
    fault: Fault,
    frames: usize,
    inputs: Vec<Vec<Image>>,
    outputs: Vec<Vec<Image>>,
    contexts: Vec<Box<dyn ModuleContext>>,
}

impl ProbeModule {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            fault: Fault::None,
            frames: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            contexts: Vec::new(),
        }
    }

    pub fn failing(self) -> Self {
        self.with_fault(Fault::FailRender)
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    fn resolve(
        &self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
        direction: SlotDirection,
    ) -> BackendResult<Vec<Image>> {
        if self.fault == Fault::LeaveUnbound {
            return Ok(images.iter().flatten().copied().collect());
        }

        let extent = ctx.device().presentation_extent;
        let mut resolved = Vec::with_capacity(images.len());
        for (index, (image, format)) in images.iter_mut().zip(formats).enumerate() {
            let rebind = direction == SlotDirection::Input && self.fault == Fault::RebindInputs;
            let image = match image {
                Some(image) if !rebind => *image,
                _ => {
                    let format = match direction {
                        SlotDirection::Output if self.fault == Fault::WrongFormat => Format::R32Uint,
                        _ => *format,
                    };
                    let created = ctx.create_image(&ImageDescriptor::new(
                        format!("{} {} frame {}", self.name, index, frame),
                        extent,
                        format,
                        ImageUsage::SHARED_SLOT,
                    ))?;
                    *image = Some(created);
                    created
                }
            };
            self.log
                .lock()
                .push(format!("{}:{}@{}={:?}", direction, self.name, frame, image.handle));
            resolved.push(image);
        }
        Ok(resolved)
    }
}

struct ProbeContext {
    name: String,
    frame: FrameIndex,
    log: EventLog,
    fail: bool,
    inputs: Vec<Image>,
    outputs: Vec<Image>,
}

impl ModuleContext for ProbeContext {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
        if self.fail {
            return Err(RenderAnomaly::missing(&self.name, "probe input"));
        }
        for input in &self.inputs {
            ctx.transition(input.handle, ResourceState::SHADER_READ)?;
        }
        for output in &self.outputs {
            ctx.transition(output.handle, ResourceState::STORAGE_WRITE_COMPUTE)?;
        }
        ctx.backend().cmd_dispatch(1, 1, 1);
        for output in &self.outputs {
            ctx.transition(output.handle, ResourceState::SHADER_READ)?;
        }
        self.log.lock().push(format!("render:{}@{}", self.name, self.frame));
        Ok(())
    }
}

impl PipelineModule for ProbeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, device: &DeviceContext) {
        self.frames = device.frames_in_flight;
        self.inputs = vec![Vec::new(); self.frames];
        self.outputs = vec![Vec::new(); self.frames];
    }

    fn set_or_create_input_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool> {
        if self.fault == Fault::RejectInputs {
            return Ok(false);
        }
        self.inputs[frame] = self.resolve(ctx, images, formats, frame, SlotDirection::Input)?;
        Ok(true)
    }

    fn set_or_create_output_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool> {
        if self.fault == Fault::RejectOutputs {
            return Ok(false);
        }
        self.outputs[frame] = self.resolve(ctx, images, formats, frame, SlotDirection::Output)?;
        Ok(true)
    }

    fn set_attributes(&mut self, _attributes: &Attributes) -> PipelineResult<()> {
        Ok(())
    }

    fn build(&mut self, _ctx: &mut BuildContext<'_>) -> PipelineResult<()> {
        self.log.lock().push(format!("build:{}", self.name));
        let count = match self.fault {
            Fault::ExtraContext => self.frames + 1,
            _ => self.frames,
        };
        self.contexts = (0..count)
            .map(|frame| {
                Box::new(ProbeContext {
                    name: self.name.clone(),
                    frame,
                    log: Arc::clone(&self.log),
                    fail: self.fault == Fault::FailRender,
                    inputs: self.inputs.get(frame).cloned().unwrap_or_default(),
                    outputs: self.outputs.get(frame).cloned().unwrap_or_default(),
                }) as Box<dyn ModuleContext>
            })
            .collect();
        Ok(())
    }

    fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>> {
        std::mem::take(&mut self.contexts)
    }

    fn release(&mut self, _backend: &mut dyn GpuBackend) {
        self.log.lock().push(format!("release:{}", self.name));
    }
}

/// Register a probe module under `name`.
pub fn register_probe(
    registry: &mut ModuleRegistry,
    log: &EventLog,
    name: &'static str,
    inputs: usize,
    outputs: usize,
) {
    let log = Arc::clone(log);
    registry
        .register(
            name,
            move || Box::new(ProbeModule::new(name, Arc::clone(&log))) as Box<dyn PipelineModule>,
            inputs,
            outputs,
        )
        .unwrap();
}

/// Register a probe module whose render step always reports an anomaly.
pub fn register_failing_probe(
    registry: &mut ModuleRegistry,
    log: &EventLog,
    name: &'static str,
    inputs: usize,
    outputs: usize,
) {
    register_faulty_module(registry, log, name, inputs, outputs, Fault::FailRender);
}

/// Register a test module misbehaving as `fault` says.
pub fn register_faulty_module(
    registry: &mut ModuleRegistry,
    log: &EventLog,
    name: &'static str,
    inputs: usize,
    outputs: usize,
    fault: Fault,
) {
    let log = Arc::clone(log);
    registry
        .register(
            name,
            move || {
                Box::new(ProbeModule::new(name, Arc::clone(&log)).with_fault(fault)) as Box<dyn PipelineModule>
            },
            inputs,
            outputs,
        )
        .unwrap();
}

/// Events of `log` starting with `prefix`, with the prefix stripped.
pub fn events(log: &EventLog, prefix: &str) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|event| event.strip_prefix(prefix).map(str::to_string))
        .collect()
}
