//! World pipeline graph
//!
//! Builds module instances from a [`Blueprint`] in reverse order and records
//! frames in forward order:
//!
//! ```text
//!   build:   [N-1] ─► [N-2] ─► ... ─► [0]     consumers before producers
//!   record:  [0]   ─► [1]   ─► ... ─► [N-1]   then slot 0 ─► PRESENT
//! ```
//!
//! Processing consumers first means whichever module owns a slot's size and
//! format decides it once; every other party validates against it.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backend::*;
use crate::deferred::Retire;
use crate::error::{PipelineError, PipelineResult, SlotDirection};
use crate::render_graph::allocator::ResolutionPlan;
use crate::render_graph::executor::{FrameContext, FrameReport, ModuleStep};
use crate::render_graph::module::{BuildContext, DeviceContext, ModuleContext, PipelineModule};
use crate::render_graph::resource::SharedResourceTable;
use crate::render_graph::{Blueprint, ModuleRegistry, ModuleSpec, Slot};
use crate::sync::{ResourceId, ResourceState, ResourceStateTracker};
use crate::{FrameIndex, PipelineConfig};

/// Size and format bound to one slot of one frame in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAssignment {
    pub frame: FrameIndex,
    pub slot: Slot,
    pub extent: Extent2D,
    pub format: Format,
}

/// A fully wired set of modules, shared resources and frame contexts.
pub struct WorldPipeline {
    blueprint: Arc<Blueprint>,
    plan: ResolutionPlan,
    modules: Vec<Box<dyn PipelineModule>>,
    frames: Vec<FrameContext>,
    resources: SharedResourceTable,
    tracker: ResourceStateTracker,
    build_order: Vec<usize>,
}

impl std::fmt::Debug for WorldPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldPipeline")
            .field("modules", &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("frames_in_flight", &self.frames.len())
            .field("presentation_extent", &self.plan.presentation)
            .field("render_extent", &self.plan.render)
            .finish()
    }
}

impl WorldPipeline {
    /// Instantiate and wire every module of `blueprint`.
    ///
    /// On failure every GPU object created by the attempt is destroyed before
    /// returning, so nothing half-built survives.
    pub fn build(
        registry: &ModuleRegistry,
        blueprint: Arc<Blueprint>,
        config: &PipelineConfig,
        backend: &mut dyn GpuBackend,
    ) -> PipelineResult<Self> {
        let plan = ResolutionPlan::compute(registry, &blueprint, config.presentation_extent)?;
        let frames_in_flight = config.frames_in_flight.max(1);
        let device = DeviceContext {
            frames_in_flight,
            presentation_extent: plan.presentation,
            render_extent: plan.render,
        };

        let mut builder = GraphBuilder::new(registry, Arc::clone(&blueprint), device);
        match builder.run(&plan, backend) {
            Ok(()) => {
                let pipeline = builder.finish(plan);
                log::info!(
                    "Built world pipeline: {} module(s), {} slot(s), {} frame(s) in flight, render {} / present {}",
                    pipeline.modules.len(),
                    pipeline.resources.slot_count(),
                    frames_in_flight,
                    pipeline.plan.render,
                    pipeline.plan.presentation
                );
                Ok(pipeline)
            }
            Err(err) => {
                builder.abort(backend);
                Err(err)
            }
        }
    }

    pub fn blueprint(&self) -> &Arc<Blueprint> {
        &self.blueprint
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.name())
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn presentation_extent(&self) -> Extent2D {
        self.plan.presentation
    }

    pub fn render_extent(&self) -> Extent2D {
        self.plan.render
    }

    pub fn resolution_plan(&self) -> &ResolutionPlan {
        &self.plan
    }

    /// Blueprint indices in the order modules were constructed.
    pub fn build_order(&self) -> &[usize] {
        &self.build_order
    }

    pub fn shared_image(&self, slot: Slot, frame: FrameIndex) -> Option<Image> {
        self.resources.get(slot, frame)
    }

    /// Current synchronization tag of a tracked resource.
    pub fn resource_state(&self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.tracker.state(resource)
    }

    pub fn frame_context(&self, frame: FrameIndex) -> &FrameContext {
        &self.frames[frame % self.frames.len()]
    }

    /// Slot bindings of every frame in flight, frame-major.
    pub fn slot_assignments(&self) -> Vec<SlotAssignment> {
        self.resources
            .iter()
            .map(|(frame, slot, image)| SlotAssignment {
                frame,
                slot,
                extent: image.extent,
                format: image.format,
            })
            .collect()
    }

    /// Log every bound shared image at debug level.
    pub fn dump_shared_images(&self, label: &str) {
        log::debug!("Shared images ({})", label);
        for (frame, slot, image) in self.resources.iter() {
            log::debug!(
                "  frame={} slot={} size={} format={} image={}",
                frame,
                slot,
                image.extent,
                image.format,
                image.handle.raw()
            );
        }
    }

    /// Record frame `frame` (taken modulo the frames in flight).
    pub fn render(&mut self, frame: FrameIndex, backend: &mut dyn GpuBackend) -> FrameReport {
        let index = frame % self.frames.len();
        self.frames[index].render(backend, &mut self.tracker)
    }

    /// Forward an externally owned texture to every module.
    pub fn bind_texture(
        &mut self,
        backend: &mut dyn GpuBackend,
        sampler: SamplerHandle,
        image: ImageHandle,
        index: u32,
    ) {
        for module in &mut self.modules {
            module.bind_texture(backend, sampler, image, index);
        }
    }

    pub fn pre_close(&mut self) {
        for module in &mut self.modules {
            module.pre_close();
        }
    }

    /// Destroy every module resource and shared slot image.
    ///
    /// Only call once no submitted frame can still reference them.
    pub fn release(mut self, backend: &mut dyn GpuBackend) {
        self.frames.clear();
        for module in &mut self.modules {
            module.release(backend);
        }
        let images: BTreeSet<ImageHandle> = self.resources.drain().into_iter().map(|i| i.handle).collect();
        for image in &images {
            backend.destroy_image(*image);
        }
        log::debug!(
            "Released world pipeline ({} module(s), {} shared image(s))",
            self.modules.len(),
            images.len()
        );
    }
}

impl Retire for WorldPipeline {
    fn retire(self: Box<Self>, backend: &mut dyn GpuBackend) {
        (*self).release(backend);
    }
}

/// Transient state of one graph build.
struct GraphBuilder<'r> {
    registry: &'r ModuleRegistry,
    blueprint: Arc<Blueprint>,
    device: DeviceContext,
    resources: SharedResourceTable,
    tracker: ResourceStateTracker,
    modules: Vec<Option<Box<dyn PipelineModule>>>,
    contexts: Vec<Vec<Box<dyn ModuleContext>>>,
    /// Images created during the build that never made it into the table.
    orphans: Vec<ImageHandle>,
    build_order: Vec<usize>,
}

impl<'r> GraphBuilder<'r> {
    fn new(registry: &'r ModuleRegistry, blueprint: Arc<Blueprint>, device: DeviceContext) -> Self {
        let module_count = blueprint.module_count();
        Self {
            registry,
            resources: SharedResourceTable::new(device.frames_in_flight, blueprint.slot_count()),
            blueprint,
            device,
            tracker: ResourceStateTracker::new(),
            modules: (0..module_count).map(|_| None).collect(),
            contexts: (0..module_count).map(|_| Vec::new()).collect(),
            orphans: Vec::new(),
            build_order: Vec::with_capacity(module_count),
        }
    }

    fn run(&mut self, plan: &ResolutionPlan, backend: &mut dyn GpuBackend) -> PipelineResult<()> {
        self.preallocate(plan, backend)?;
        for index in (0..self.blueprint.module_count()).rev() {
            self.build_module(index, backend)?;
        }
        Ok(())
    }

    /// Slot 0 at presentation resolution plus every render-tier slot.
    fn preallocate(&mut self, plan: &ResolutionPlan, backend: &mut dyn GpuBackend) -> PipelineResult<()> {
        for frame in 0..self.device.frames_in_flight {
            for slot in (0..self.blueprint.slot_count() as u32).map(Slot) {
                let Some(extent) = plan.extent_for(slot) else {
                    continue;
                };
                let format = self.blueprint.format(slot);
                let desc = ImageDescriptor::new(
                    format!("slot {} frame {}", slot, frame),
                    extent,
                    format,
                    ImageUsage::SHARED_SLOT,
                );
                let handle = backend.create_image(&desc)?;
                self.tracker.register(handle, ResourceState::UNDEFINED);
                self.resources.set(slot, frame, Image { handle, extent, format });
            }
        }
        Ok(())
    }

    fn build_module(&mut self, index: usize, backend: &mut dyn GpuBackend) -> PipelineResult<()> {
        let blueprint = Arc::clone(&self.blueprint);
        let spec = &blueprint.modules()[index];
        let mut module = self.registry.lookup(&spec.name)?.construct();
        module.init(&self.device);
        self.build_order.push(index);
        log::debug!("Building module '{}' at position {}", spec.name, index);

        let result = self.wire_module(index, module.as_mut(), spec, backend);
        self.modules[index] = Some(module);
        result
    }

    fn wire_module(
        &mut self,
        index: usize,
        module: &mut dyn PipelineModule,
        spec: &ModuleSpec,
        backend: &mut dyn GpuBackend,
    ) -> PipelineResult<()> {
        let output_formats: Vec<Format> = spec.outputs.iter().map(|s| self.blueprint.format(*s)).collect();
        let input_formats: Vec<Format> = spec.inputs.iter().map(|s| self.blueprint.format(*s)).collect();

        for frame in 0..self.device.frames_in_flight {
            let mut outputs = self.resources.gather(&spec.outputs, frame);
            let accepted = {
                let mut ctx = BuildContext::new(backend, &mut self.tracker, self.device);
                ctx.set_bound_inputs(self.resources.gather(&spec.inputs, frame));
                module.set_or_create_output_images(&mut ctx, &mut outputs, &output_formats, frame)
            };
            self.bind_slots(&spec.name, &spec.outputs, &outputs, frame)?;
            if !accepted? {
                return Err(PipelineError::OutputResourceMismatch {
                    module: spec.name.clone(),
                    frame,
                });
            }
            self.validate(&spec.name, SlotDirection::Output, &spec.outputs, &outputs, frame)?;

            let mut inputs = self.resources.gather(&spec.inputs, frame);
            let accepted = {
                let mut ctx = BuildContext::new(backend, &mut self.tracker, self.device);
                ctx.set_bound_inputs(inputs.clone());
                module.set_or_create_input_images(&mut ctx, &mut inputs, &input_formats, frame)
            };
            self.bind_slots(&spec.name, &spec.inputs, &inputs, frame)?;
            if !accepted? {
                return Err(PipelineError::InputResourceMismatch {
                    module: spec.name.clone(),
                    frame,
                });
            }
            self.validate(&spec.name, SlotDirection::Input, &spec.inputs, &inputs, frame)?;
        }

        module.set_attributes(&spec.attributes)?;

        let mut ctx = BuildContext::new(backend, &mut self.tracker, self.device);
        module.build(&mut ctx)?;

        let contexts = module.take_contexts();
        if contexts.len() != self.device.frames_in_flight {
            return Err(PipelineError::ContextCountMismatch {
                module: spec.name.clone(),
                expected: self.device.frames_in_flight,
                actual: contexts.len(),
            });
        }
        self.contexts[index] = contexts;
        Ok(())
    }

    /// Write images a module created back into the table.
    ///
    /// An image replacing an existing binding is kept aside for cleanup and
    /// reported as a rebind.
    fn bind_slots(
        &mut self,
        module: &str,
        slots: &[Slot],
        images: &[Option<Image>],
        frame: FrameIndex,
    ) -> PipelineResult<()> {
        let mut rebound = None;
        for (slot, image) in slots.iter().zip(images) {
            let Some(image) = image else {
                continue;
            };
            match self.resources.get(*slot, frame) {
                None => {
                    self.resources.set(*slot, frame, *image);
                }
                Some(existing) if existing.handle != image.handle => {
                    self.orphans.push(image.handle);
                    rebound.get_or_insert(*slot);
                }
                Some(_) => {}
            }
        }

        match rebound {
            Some(slot) => Err(PipelineError::SlotRebound {
                module: module.to_string(),
                slot,
                frame,
            }),
            None => Ok(()),
        }
    }

    fn validate(
        &self,
        module: &str,
        direction: SlotDirection,
        slots: &[Slot],
        images: &[Option<Image>],
        frame: FrameIndex,
    ) -> PipelineResult<()> {
        for (slot, image) in slots.iter().zip(images) {
            let Some(image) = image else {
                let module = module.to_string();
                let slot = *slot;
                return Err(match direction {
                    SlotDirection::Input => PipelineError::UnresolvedInput { module, slot, frame },
                    SlotDirection::Output => PipelineError::UnresolvedOutput { module, slot, frame },
                });
            };
            let expected = self.blueprint.format(*slot);
            if image.format != expected {
                return Err(PipelineError::FormatMismatch {
                    module: module.to_string(),
                    slot: *slot,
                    expected,
                    actual: image.format,
                });
            }
        }
        Ok(())
    }

    fn finish(self, plan: ResolutionPlan) -> WorldPipeline {
        let frames_in_flight = self.device.frames_in_flight;
        let mut per_module: Vec<_> = self.contexts.into_iter().map(Vec::into_iter).collect();

        let frames = (0..frames_in_flight)
            .map(|frame| {
                let steps = per_module
                    .iter_mut()
                    .zip(self.blueprint.modules())
                    .filter_map(|(contexts, spec)| {
                        contexts.next().map(|context| ModuleStep {
                            module: spec.name.clone(),
                            context,
                        })
                    })
                    .collect();
                FrameContext::new(frame, self.resources.get(Slot::PRESENT, frame), steps)
            })
            .collect();

        WorldPipeline {
            blueprint: self.blueprint,
            plan,
            modules: self.modules.into_iter().flatten().collect(),
            frames,
            resources: self.resources,
            tracker: self.tracker,
            build_order: self.build_order,
        }
    }

    /// Destroy everything the failed build created.
    fn abort(mut self, backend: &mut dyn GpuBackend) {
        self.contexts.clear();
        for module in self.modules.iter_mut().flatten() {
            module.release(backend);
        }
        let mut images: BTreeSet<ImageHandle> = self.resources.drain().into_iter().map(|i| i.handle).collect();
        images.extend(self.orphans.drain(..));
        for image in &images {
            backend.destroy_image(*image);
        }
        log::warn!(
            "Aborted world pipeline build, destroyed {} shared image(s)",
            images.len()
        );
    }
}
