//! Pipeline lifecycle
//!
//! [`Pipeline`] owns the installed blueprint, the live [`WorldPipeline`] and
//! the deferred collector. A typical frame loop:
//!
//! ```text
//!   wait fence(frame) ─► begin_frame(frame) ─► [rebuild if needed] ─► render(frame) ─► submit
//! ```
//!
//! Rebuilds are wholesale: the new world pipeline is fully built before the
//! old one is retired, and the old one is only destroyed once the frame it
//! was replaced in comes around again.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::*;
use crate::deferred::DeferredCollector;
use crate::error::{PipelineError, PipelineResult};
use crate::render_graph::{Blueprint, BlueprintDesc, FrameReport, ModuleRegistry, WorldPipeline};
use crate::{FrameIndex, PipelineConfig};

/// Outer owner of the world pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    blueprint: Option<Arc<Blueprint>>,
    world: Option<WorldPipeline>,
    collector: DeferredCollector,
    textures: BTreeMap<u32, (SamplerHandle, ImageHandle)>,
    needs_rebuild: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            collector: DeferredCollector::new(config.frames_in_flight),
            config,
            blueprint: None,
            world: None,
            textures: BTreeMap::new(),
            needs_rebuild: false,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn blueprint(&self) -> Option<&Arc<Blueprint>> {
        self.blueprint.as_ref()
    }

    pub fn world(&self) -> Option<&WorldPipeline> {
        self.world.as_ref()
    }

    pub fn collector(&self) -> &DeferredCollector {
        &self.collector
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Validate and install a new blueprint. The previous one stays
    /// installed if validation fails.
    pub fn set_blueprint(&mut self, registry: &ModuleRegistry, desc: &BlueprintDesc) -> PipelineResult<()> {
        let blueprint = Blueprint::build(registry, desc)?;
        log::info!(
            "Installed blueprint with {} module(s)",
            blueprint.module_count()
        );
        self.blueprint = Some(Arc::new(blueprint));
        self.needs_rebuild = true;
        Ok(())
    }

    /// Record a new presentation extent; the world pipeline is rebuilt on the
    /// next `rebuild`.
    pub fn resize(&mut self, extent: Extent2D) {
        if extent.is_empty() {
            log::debug!("Ignoring resize to empty extent {}", extent);
            return;
        }
        if extent == self.config.presentation_extent {
            return;
        }
        log::info!(
            "Presentation extent {} -> {}",
            self.config.presentation_extent,
            extent
        );
        self.config.presentation_extent = extent;
        self.needs_rebuild = true;
    }

    /// Build a new world pipeline from the installed blueprint and swap it in.
    ///
    /// `frame` is the frame in flight being recorded; the replaced pipeline is
    /// released when that frame's queue is next released. On failure the
    /// current world pipeline stays installed.
    pub fn rebuild(
        &mut self,
        registry: &ModuleRegistry,
        backend: &mut dyn GpuBackend,
        frame: FrameIndex,
    ) -> PipelineResult<()> {
        let blueprint = self.blueprint.clone().ok_or(PipelineError::NoBlueprint)?;
        if let Some(world) = &mut self.world {
            world.pre_close();
        }

        let mut world = match WorldPipeline::build(registry, blueprint, &self.config, backend) {
            Ok(world) => world,
            Err(err) => {
                log::error!("World pipeline rebuild failed, keeping the current one: {}", err);
                return Err(err);
            }
        };

        for (index, (sampler, image)) in &self.textures {
            world.bind_texture(backend, *sampler, *image, *index);
        }
        world.dump_shared_images("rebuild");

        if let Some(old) = self.world.replace(world) {
            self.collector.collect(frame, old);
        }
        self.needs_rebuild = false;
        Ok(())
    }

    /// Release resources retired under `frame`.
    ///
    /// Call after waiting on the fence of `frame`.
    pub fn begin_frame(&mut self, frame: FrameIndex, backend: &mut dyn GpuBackend) -> usize {
        self.collector.release(frame, backend)
    }

    /// Record `frame` of the live world pipeline.
    pub fn render(&mut self, frame: FrameIndex, backend: &mut dyn GpuBackend) -> PipelineResult<FrameReport> {
        let world = self.world.as_mut().ok_or(PipelineError::NoBlueprint)?;
        Ok(world.render(frame, backend))
    }

    /// Bind a scene texture at `index`. Remembered across rebuilds.
    pub fn bind_texture(
        &mut self,
        backend: &mut dyn GpuBackend,
        sampler: SamplerHandle,
        image: ImageHandle,
        index: u32,
    ) {
        self.textures.insert(index, (sampler, image));
        if let Some(world) = &mut self.world {
            world.bind_texture(backend, sampler, image, index);
        }
    }

    /// Tear everything down. The device must be idle.
    pub fn close(mut self, registry: &ModuleRegistry, backend: &mut dyn GpuBackend) {
        if let Some(world) = &mut self.world {
            world.pre_close();
        }
        registry.run_shutdown_hooks();

        let retired = self.collector.flush_all(backend);
        if let Some(world) = self.world.take() {
            world.release(backend);
        }
        log::info!("Pipeline closed ({} retired resource(s) flushed)", retired);
    }
}
