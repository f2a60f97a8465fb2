//! Pipeline module contract
//!
//! A module is one configurable step of the world pipeline. One instance is
//! shared by every frame in flight; it owns its private GPU objects and hands
//! out one [`ModuleContext`] per frame, which records the module's commands.
//!
//! Construction happens in reverse blueprint order through [`BuildContext`],
//! recording in forward order through [`RenderContext`].

use crate::backend::*;
use crate::error::{PipelineError, PipelineResult, RenderAnomaly};
use crate::sync::{ResourceId, ResourceState, ResourceStateTracker};
use crate::FrameIndex;

/// Attribute key/value pairs attached to a module in the blueprint.
pub type Attributes = [(String, String)];

/// Device-level facts every module may read during construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    pub frames_in_flight: usize,
    /// Final presented resolution (slot 0).
    pub presentation_extent: Extent2D,
    /// Internal resolution for modules upstream of a resolution-changing module.
    pub render_extent: Extent2D,
}

/// Access to the backend and the state tracker while the graph is built.
pub struct BuildContext<'a> {
    backend: &'a mut dyn GpuBackend,
    tracker: &'a mut ResourceStateTracker,
    device: DeviceContext,
    bound_inputs: Vec<Option<Image>>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(
        backend: &'a mut dyn GpuBackend,
        tracker: &'a mut ResourceStateTracker,
        device: DeviceContext,
    ) -> Self {
        Self {
            backend,
            tracker,
            device,
            bound_inputs: Vec::new(),
        }
    }

    pub(crate) fn set_bound_inputs(&mut self, inputs: Vec<Option<Image>>) {
        self.bound_inputs = inputs;
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn backend(&mut self) -> &mut dyn GpuBackend {
        &mut *self.backend
    }

    /// Images currently bound to the module's input slots for the frame being
    /// resolved, before the module's own input resolution runs.
    ///
    /// Lets a module size a freshly created output after an existing input.
    pub fn bound_inputs(&self) -> &[Option<Image>] {
        &self.bound_inputs
    }

    /// Create an image and start tracking it as `UNDEFINED`.
    pub fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<Image> {
        let handle = self.backend.create_image(desc)?;
        self.tracker.register(handle, ResourceState::UNDEFINED);
        Ok(Image {
            handle,
            extent: desc.extent,
            format: desc.format,
        })
    }

    /// Create a buffer and start tracking it as `UNDEFINED`.
    pub fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let handle = self.backend.create_buffer(desc)?;
        self.tracker.register(handle, ResourceState::UNDEFINED);
        Ok(handle)
    }
}

/// Access to the backend and the state tracker while a frame is recorded.
pub struct RenderContext<'a> {
    backend: &'a mut dyn GpuBackend,
    tracker: &'a mut ResourceStateTracker,
    frame: FrameIndex,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(
        backend: &'a mut dyn GpuBackend,
        tracker: &'a mut ResourceStateTracker,
        frame: FrameIndex,
    ) -> Self {
        Self {
            backend,
            tracker,
            frame,
        }
    }

    pub fn frame_index(&self) -> FrameIndex {
        self.frame
    }

    pub fn backend(&mut self) -> &mut dyn GpuBackend {
        &mut *self.backend
    }

    pub fn state(&self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.tracker.state(resource)
    }

    /// Fail with an anomaly unless every resource is tracked.
    ///
    /// Modules call this before recording anything so that a skipped step
    /// leaves no partial commands behind.
    pub fn ensure_tracked(&self, resources: &[ResourceId]) -> Result<(), RenderAnomaly> {
        match resources.iter().find(|id| !self.tracker.is_tracked(**id)) {
            Some(missing) => Err(RenderAnomaly::UntrackedResource(*missing)),
            None => Ok(()),
        }
    }

    /// Bring `resource` into `required`, recording a barrier if needed.
    pub fn transition(
        &mut self,
        resource: impl Into<ResourceId>,
        required: ResourceState,
    ) -> Result<(), RenderAnomaly> {
        if let Some(barrier) = self.tracker.transition(resource, required)? {
            self.backend.cmd_pipeline_barrier(&[barrier]);
        }
        Ok(())
    }

    /// Transition several resources, recording the barriers as one batch.
    pub fn transition_all(
        &mut self,
        requests: &[(ResourceId, ResourceState)],
    ) -> Result<(), RenderAnomaly> {
        let barriers = self.tracker.transition_batch(requests)?;
        if !barriers.is_empty() {
            self.backend.cmd_pipeline_barrier(&barriers);
        }
        Ok(())
    }
}

/// Per-frame render object of a module.
pub trait ModuleContext: Send {
    /// Record this module's contribution to the frame, touching only its bound
    /// slots and private resources.
    ///
    /// Every touched resource must be left in a well-defined state: intermediate
    /// outputs end in [`ResourceState::SHADER_READ`].
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly>;
}

/// A pluggable world pipeline module.
pub trait PipelineModule: Send {
    /// Get module name
    fn name(&self) -> &str;

    /// Called once, right after construction.
    fn init(&mut self, _device: &DeviceContext) {}

    /// Validate or create the images bound to the module's input slots.
    ///
    /// `images[i]` is `None` when nothing is bound yet; the module may create
    /// it and must then write it back. Returning `Ok(false)` rejects the
    /// binding (e.g. a size mismatch).
    fn set_or_create_input_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool>;

    /// Validate or create the images bound to the module's output slots.
    fn set_or_create_output_images(
        &mut self,
        ctx: &mut BuildContext<'_>,
        images: &mut [Option<Image>],
        formats: &[Format],
        frame: FrameIndex,
    ) -> BackendResult<bool>;

    /// Apply blueprint attributes. Unknown keys are ignored.
    fn set_attributes(&mut self, attributes: &Attributes) -> PipelineResult<()>;

    /// Create private GPU objects and the per-frame contexts.
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> PipelineResult<()>;

    /// Hand over the per-frame contexts created by `build`, indexed by frame.
    fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>>;

    /// Bind an externally owned texture at `index` of the module's texture array.
    fn bind_texture(
        &mut self,
        _backend: &mut dyn GpuBackend,
        _sampler: SamplerHandle,
        _image: ImageHandle,
        _index: u32,
    ) {
    }

    /// Called before the module is retired.
    fn pre_close(&mut self) {}

    /// Destroy every private GPU object. Shared slot images are not owned by
    /// the module and must not be destroyed here.
    fn release(&mut self, backend: &mut dyn GpuBackend);
}

/// Strip the `render_pipeline.module.<module>.attribute.` prefix from `key`.
///
/// Returns `None` for keys addressed to other modules.
pub fn attribute_name<'k>(module: &str, key: &'k str) -> Option<&'k str> {
    key.strip_prefix("render_pipeline.module.")?
        .strip_prefix(module)?
        .strip_prefix(".attribute.")
}

/// Full attribute key of `name` for `module`.
pub fn attribute_key(module: &str, name: &str) -> String {
    format!("render_pipeline.module.{}.attribute.{}", module, name)
}

/// Parse an attribute value, mapping failures to `InvalidAttribute`.
pub fn parse_attribute<T: std::str::FromStr>(module: &str, key: &str, value: &str) -> PipelineResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::InvalidAttribute {
            module: module.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Parse a boolean attribute: `1`/`true` and `0`/`false`, case-insensitive.
pub fn parse_bool_attribute(module: &str, key: &str, value: &str) -> PipelineResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(PipelineError::InvalidAttribute {
            module: module.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Module that binds whatever it is given and records nothing.
    #[derive(Default)]
    pub struct NullModule {
        frames: usize,
    }

    struct NullContext;

    impl ModuleContext for NullContext {
        fn render(&mut self, _ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
            Ok(())
        }
    }

    impl PipelineModule for NullModule {
        fn name(&self) -> &str {
            "null"
        }

        fn init(&mut self, device: &DeviceContext) {
            self.frames = device.frames_in_flight;
        }

        fn set_or_create_input_images(
            &mut self,
            _ctx: &mut BuildContext<'_>,
            images: &mut [Option<Image>],
            _formats: &[Format],
            _frame: FrameIndex,
        ) -> BackendResult<bool> {
            Ok(images.iter().all(Option::is_some))
        }

        fn set_or_create_output_images(
            &mut self,
            ctx: &mut BuildContext<'_>,
            images: &mut [Option<Image>],
            formats: &[Format],
            _frame: FrameIndex,
        ) -> BackendResult<bool> {
            let extent = ctx.device().presentation_extent;
            for (image, format) in images.iter_mut().zip(formats) {
                if image.is_none() {
                    *image = Some(ctx.create_image(&ImageDescriptor::new(
                        "null output",
                        extent,
                        *format,
                        ImageUsage::SHARED_SLOT,
                    ))?);
                }
            }
            Ok(true)
        }

        fn set_attributes(&mut self, _attributes: &Attributes) -> PipelineResult<()> {
            Ok(())
        }

        fn build(&mut self, _ctx: &mut BuildContext<'_>) -> PipelineResult<()> {
            Ok(())
        }

        fn take_contexts(&mut self) -> Vec<Box<dyn ModuleContext>> {
            (0..self.frames)
                .map(|_| Box::new(NullContext) as Box<dyn ModuleContext>)
                .collect()
        }

        fn release(&mut self, _backend: &mut dyn GpuBackend) {}
    }

    #[test]
    fn test_parse_attribute() {
        assert_eq!(parse_attribute::<f32>("m", "k", " 1.5 ").unwrap(), 1.5);
        assert!(matches!(
            parse_attribute::<u32>("m", "k", "abc"),
            Err(PipelineError::InvalidAttribute { key, .. }) if key == "k"
        ));
    }

    #[test]
    fn test_attribute_name() {
        let key = attribute_key("bloom", "intensity");
        assert_eq!(key, "render_pipeline.module.bloom.attribute.intensity");
        assert_eq!(attribute_name("bloom", &key), Some("intensity"));
        assert_eq!(attribute_name("tone_mapping", &key), None);
        assert_eq!(attribute_name("bloom", "intensity"), None);
    }

    #[test]
    fn test_parse_bool_attribute() {
        assert!(parse_bool_attribute("m", "k", "TRUE").unwrap());
        assert!(parse_bool_attribute("m", "k", "1").unwrap());
        assert!(!parse_bool_attribute("m", "k", "false").unwrap());
        assert!(parse_bool_attribute("m", "k", "yes").is_err());
    }

    #[test]
    fn test_render_context_transition_records_barrier() {
        let mut backend = RecordingBackend::new();
        let mut tracker = ResourceStateTracker::new();
        let image = ImageHandle::from_raw(11);
        tracker.register(image, ResourceState::UNDEFINED);

        let mut ctx = RenderContext::new(&mut backend, &mut tracker, 0);
        ctx.transition(image, ResourceState::SHADER_READ).unwrap();
        // second read in the same state is free
        ctx.transition(image, ResourceState::SHADER_READ).unwrap();

        assert_eq!(backend.barriers().len(), 1);
    }

    #[test]
    fn test_ensure_tracked_reports_missing() {
        let mut backend = RecordingBackend::new();
        let mut tracker = ResourceStateTracker::new();
        let image = ImageHandle::from_raw(3);

        let ctx = RenderContext::new(&mut backend, &mut tracker, 1);
        assert_eq!(
            ctx.ensure_tracked(&[image.into()]),
            Err(RenderAnomaly::UntrackedResource(ResourceId::Image(image)))
        );
    }
}
