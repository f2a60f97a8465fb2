//! Built-in world pipeline modules and the pipeline lifecycle
//!
//! The default world pipeline chains the built-in modules like this:
//!
//! ```text
//!  ray_tracing ──1,5,6──► upscaler ──7──► bloom ──8──► tone_mapping ──0──► present
//!      └─2,3,4 (albedo, normals: available to other modules)
//! ```

pub mod lifecycle;
pub mod postprocess;
pub mod ray_tracing;
pub mod upscaler;

pub use lifecycle::Pipeline;
pub use postprocess::*;
pub use ray_tracing::*;
pub use upscaler::*;

use crate::backend::*;
use crate::error::PipelineResult;
use crate::render_graph::{attribute_key, BlueprintDesc, BuildContext, ModuleDescriptor, ModuleRegistry, ModuleSpec};
use crate::FrameIndex;

/// Descriptors of every module shipped with this crate.
pub fn builtin_module_descriptors() -> Vec<ModuleDescriptor> {
    vec![
        RayTracingModule::descriptor(),
        UpscalerModule::descriptor(),
        BloomModule::descriptor(),
        ToneMappingModule::descriptor(),
    ]
}

/// Register every built-in module into `registry`.
pub fn register_builtin_modules(registry: &mut ModuleRegistry) -> PipelineResult<()> {
    for descriptor in builtin_module_descriptors() {
        registry.register_descriptor(descriptor)?;
    }
    Ok(())
}

/// Ray tracing, upscaling, bloom and tone mapping wired over nine slots.
pub fn default_world_blueprint(quality: QualityMode) -> BlueprintDesc {
    BlueprintDesc::new()
        .module(ModuleSpec::new(RAY_TRACING_MODULE_NAME).outputs([1, 2, 3, 4, 5, 6]))
        .module(
            ModuleSpec::new(UPSCALER_MODULE_NAME)
                .inputs([1, 5, 6])
                .output(7)
                .attribute(attribute_key(UPSCALER_MODULE_NAME, "quality_mode"), quality.name()),
        )
        .module(ModuleSpec::new(BLOOM_MODULE_NAME).input(7).output(8))
        .module(ModuleSpec::new(TONE_MAPPING_MODULE_NAME).input(8).output(0))
        .formats([
            Format::Rgba8Unorm,  // 0 presented
            Format::Rgba16Float, // 1 hdr noisy
            Format::Rgba8Unorm,  // 2 diffuse albedo
            Format::Rgba8Unorm,  // 3 specular albedo
            Format::Rgba16Float, // 4 normal roughness
            Format::Rg16Float,   // 5 motion vectors
            Format::R32Float,    // 6 linear depth
            Format::Rgba16Float, // 7 upscaled hdr
            Format::Rgba16Float, // 8 hdr with bloom
        ])
}

/// Validate `images` against `extent`, creating every unbound one at it.
///
/// Returns `false` without creating anything if a bound image has another
/// extent.
pub(crate) fn bind_or_create(
    ctx: &mut BuildContext<'_>,
    images: &mut [Option<Image>],
    formats: &[Format],
    extent: Extent2D,
    label: &str,
    frame: FrameIndex,
) -> BackendResult<bool> {
    if let Some(mismatch) = images.iter().flatten().find(|image| image.extent != extent) {
        log::error!(
            "{}: bound image is {} but {} is required (frame {})",
            label,
            mismatch.extent,
            extent,
            frame
        );
        return Ok(false);
    }

    for (index, (image, format)) in images.iter_mut().zip(formats).enumerate() {
        if image.is_none() {
            *image = Some(ctx.create_image(&ImageDescriptor::new(
                format!("{} {} frame {}", label, index, frame),
                extent,
                *format,
                ImageUsage::SHARED_SLOT,
            ))?);
        }
    }
    Ok(true)
}

pub(crate) fn release_tables(backend: &mut dyn GpuBackend, tables: &[BindingTableHandle]) {
    for table in tables {
        backend.destroy_binding_table(*table);
    }
}
