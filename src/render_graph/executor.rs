//! Frame context execution

use crate::backend::{GpuBackend, Image};
use crate::error::RenderAnomaly;
use crate::render_graph::module::{ModuleContext, RenderContext};
use crate::sync::{ResourceState, ResourceStateTracker};
use crate::FrameIndex;

/// One module's render object inside a frame context.
pub struct ModuleStep {
    pub module: String,
    pub context: Box<dyn ModuleContext>,
}

/// Outcome of recording one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: FrameIndex,
    /// Names of the modules whose step completed, in execution order.
    pub executed: Vec<String>,
    /// Modules skipped this frame and the anomaly that caused it.
    pub skipped: Vec<(String, RenderAnomaly)>,
    /// Slot 0 image, left in [`ResourceState::PRESENT`].
    pub output: Option<Image>,
}

impl FrameReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Everything needed to record one frame in flight: the module steps in
/// forward blueprint order plus the presented slot 0 image.
pub struct FrameContext {
    frame: FrameIndex,
    output: Option<Image>,
    steps: Vec<ModuleStep>,
}

impl FrameContext {
    pub(crate) fn new(frame: FrameIndex, output: Option<Image>, steps: Vec<ModuleStep>) -> Self {
        Self { frame, output, steps }
    }

    pub fn frame_index(&self) -> FrameIndex {
        self.frame
    }

    pub fn output(&self) -> Option<Image> {
        self.output
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.module.as_str())
    }

    /// Record every module step in order, then hand slot 0 over to presentation.
    ///
    /// A step that reports an anomaly is logged and skipped; the remaining
    /// steps still run.
    pub fn render(&mut self, backend: &mut dyn GpuBackend, tracker: &mut ResourceStateTracker) -> FrameReport {
        let mut report = FrameReport {
            frame: self.frame,
            executed: Vec::with_capacity(self.steps.len()),
            skipped: Vec::new(),
            output: self.output,
        };

        for step in &mut self.steps {
            let mut ctx = RenderContext::new(backend, tracker, self.frame);
            match step.context.render(&mut ctx) {
                Ok(()) => report.executed.push(step.module.clone()),
                Err(anomaly) => {
                    log::warn!(
                        "Skipping module '{}' for frame {}: {}",
                        step.module,
                        self.frame,
                        anomaly
                    );
                    report.skipped.push((step.module.clone(), anomaly));
                }
            }
        }

        if let Some(output) = self.output {
            let mut ctx = RenderContext::new(backend, tracker, self.frame);
            if let Err(anomaly) = ctx.transition(output.handle, ResourceState::PRESENT) {
                log::warn!("Frame {} output not presentable: {}", self.frame, anomaly);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Extent2D, Format, ImageHandle, RecordingBackend};

    struct WriteOnce {
        image: ImageHandle,
    }

    impl ModuleContext for WriteOnce {
        fn render(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), RenderAnomaly> {
            ctx.transition(self.image, ResourceState::STORAGE_WRITE_COMPUTE)?;
            ctx.backend().cmd_dispatch(1, 1, 1);
            ctx.transition(self.image, ResourceState::SHADER_READ)
        }
    }

    fn output(raw: u64) -> Image {
        Image {
            handle: ImageHandle::from_raw(raw),
            extent: Extent2D::new(2, 2),
            format: Format::Rgba8Unorm,
        }
    }

    #[test]
    fn test_untracked_step_is_skipped_and_rest_runs() {
        let mut backend = RecordingBackend::new();
        let mut tracker = ResourceStateTracker::new();
        let good = output(1);
        tracker.register(good.handle, ResourceState::UNDEFINED);

        let mut frame = FrameContext::new(
            0,
            Some(good),
            vec![
                ModuleStep {
                    module: "broken".into(),
                    context: Box::new(WriteOnce {
                        image: ImageHandle::from_raw(99),
                    }),
                },
                ModuleStep {
                    module: "good".into(),
                    context: Box::new(WriteOnce { image: good.handle }),
                },
            ],
        );

        let report = frame.render(&mut backend, &mut tracker);
        assert_eq!(report.executed, vec!["good".to_string()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(backend.dispatches().len(), 1);
        assert_eq!(tracker.state(good.handle), Some(ResourceState::PRESENT));
    }

    #[test]
    fn test_output_ends_presentable_without_steps() {
        let mut backend = RecordingBackend::new();
        let mut tracker = ResourceStateTracker::new();
        let image = output(4);
        tracker.register(image.handle, ResourceState::SHADER_READ);

        let report = FrameContext::new(1, Some(image), Vec::new()).render(&mut backend, &mut tracker);
        assert!(report.is_complete());
        assert_eq!(backend.barriers().len(), 1);
        assert_eq!(backend.barriers()[0].dst, ResourceState::PRESENT);
    }
}
