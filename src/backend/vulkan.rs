//! Vulkan barrier emission using ash
//!
//! Converts tracker states into synchronization2 structures and records a
//! barrier batch into a real command buffer. Resource handles are mapped to
//! Vulkan objects through [`VulkanHandleResolver`], which the owner of the
//! device implements.

use ash::vk;

use crate::backend::types::{Format, ImageUsage};
use crate::backend::{BufferHandle, ImageHandle};
use crate::sync::{AccessFlags, Barrier, ImageLayout, PipelineStages, ResourceId};

impl PipelineStages {
    /// Convert to Vulkan synchronization2 stage flags.
    pub fn to_vk(self) -> vk::PipelineStageFlags2 {
        let mut flags = vk::PipelineStageFlags2::NONE;
        for (stage, vk_stage) in [
            (PipelineStages::TOP_OF_PIPE, vk::PipelineStageFlags2::TOP_OF_PIPE),
            (PipelineStages::DRAW_INDIRECT, vk::PipelineStageFlags2::DRAW_INDIRECT),
            (PipelineStages::VERTEX_SHADER, vk::PipelineStageFlags2::VERTEX_SHADER),
            (PipelineStages::FRAGMENT_SHADER, vk::PipelineStageFlags2::FRAGMENT_SHADER),
            (
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ),
            (PipelineStages::COMPUTE_SHADER, vk::PipelineStageFlags2::COMPUTE_SHADER),
            (
                PipelineStages::RAY_TRACING_SHADER,
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            ),
            (PipelineStages::TRANSFER, vk::PipelineStageFlags2::TRANSFER),
            (PipelineStages::BOTTOM_OF_PIPE, vk::PipelineStageFlags2::BOTTOM_OF_PIPE),
            (PipelineStages::ALL_COMMANDS, vk::PipelineStageFlags2::ALL_COMMANDS),
        ] {
            if self.contains(stage) {
                flags |= vk_stage;
            }
        }
        flags
    }
}

impl AccessFlags {
    /// Convert to Vulkan synchronization2 access flags.
    pub fn to_vk(self) -> vk::AccessFlags2 {
        let mut flags = vk::AccessFlags2::NONE;
        for (access, vk_access) in [
            (
                AccessFlags::INDIRECT_COMMAND_READ,
                vk::AccessFlags2::INDIRECT_COMMAND_READ,
            ),
            (AccessFlags::UNIFORM_READ, vk::AccessFlags2::UNIFORM_READ),
            (AccessFlags::SHADER_READ, vk::AccessFlags2::SHADER_READ),
            (AccessFlags::SHADER_WRITE, vk::AccessFlags2::SHADER_WRITE),
            (
                AccessFlags::COLOR_ATTACHMENT_READ,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            ),
            (
                AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            (AccessFlags::TRANSFER_READ, vk::AccessFlags2::TRANSFER_READ),
            (AccessFlags::TRANSFER_WRITE, vk::AccessFlags2::TRANSFER_WRITE),
            (AccessFlags::MEMORY_READ, vk::AccessFlags2::MEMORY_READ),
            (AccessFlags::MEMORY_WRITE, vk::AccessFlags2::MEMORY_WRITE),
        ] {
            if self.contains(access) {
                flags |= vk_access;
            }
        }
        flags
    }
}

impl ImageLayout {
    /// Convert to Vulkan image layout.
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::General => vk::ImageLayout::GENERAL,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::A2b10g10r10Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
            Format::B10g11r11Ufloat => vk::Format::B10G11R11_UFLOAT_PACK32,
            Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::Rg16Float => vk::Format::R16G16_SFLOAT,
            Format::Rg32Float => vk::Format::R32G32_SFLOAT,
            Format::R16Float => vk::Format::R16_SFLOAT,
            Format::R32Float => vk::Format::R32_SFLOAT,
            Format::R32Uint => vk::Format::R32_UINT,
            Format::Depth32Float => vk::Format::D32_SFLOAT,
        }
    }

    pub fn aspect_mask(self) -> vk::ImageAspectFlags {
        if self.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }
}

impl ImageUsage {
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(ImageUsage::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(ImageUsage::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if self.contains(ImageUsage::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(ImageUsage::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(ImageUsage::COLOR_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        flags
    }
}

/// Maps graph handles to the Vulkan objects behind them.
pub trait VulkanHandleResolver {
    fn image(&self, image: ImageHandle) -> Option<(vk::Image, Format)>;
    fn buffer(&self, buffer: BufferHandle) -> Option<vk::Buffer>;
}

/// Build an image barrier covering every mip level and layer of `image`.
pub fn image_barrier(
    barrier: &Barrier,
    image: vk::Image,
    format: Format,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(barrier.src.stages.to_vk())
        .src_access_mask(barrier.src.access.to_vk())
        .dst_stage_mask(barrier.dst.stages.to_vk())
        .dst_access_mask(barrier.dst.access.to_vk())
        .old_layout(barrier.src.layout.to_vk())
        .new_layout(barrier.dst.layout.to_vk())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: format.aspect_mask(),
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
}

/// Build a whole-buffer memory barrier.
pub fn buffer_barrier(barrier: &Barrier, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(barrier.src.stages.to_vk())
        .src_access_mask(barrier.src.access.to_vk())
        .dst_stage_mask(barrier.dst.stages.to_vk())
        .dst_access_mask(barrier.dst.access.to_vk())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Record a barrier batch with `vkCmdPipelineBarrier2`.
///
/// Barriers whose resource cannot be resolved are skipped with a warning.
///
/// # Safety
///
/// `command_buffer` must be in the recording state and belong to `device`, and
/// every resolved handle must be a live object of `device`.
pub unsafe fn record_barriers(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    barriers: &[Barrier],
    resolver: &dyn VulkanHandleResolver,
) {
    let mut image_barriers = Vec::new();
    let mut buffer_barriers = Vec::new();

    for barrier in barriers {
        match barrier.resource {
            ResourceId::Image(handle) => match resolver.image(handle) {
                Some((image, format)) => image_barriers.push(image_barrier(barrier, image, format)),
                None => log::warn!("Skipping barrier on unresolved image {:?}", handle),
            },
            ResourceId::Buffer(handle) => match resolver.buffer(handle) {
                Some(buffer) => buffer_barriers.push(buffer_barrier(barrier, buffer)),
                None => log::warn!("Skipping barrier on unresolved buffer {:?}", handle),
            },
        }
    }

    if image_barriers.is_empty() && buffer_barriers.is_empty() {
        return;
    }

    let dependency_info = vk::DependencyInfo::default()
        .image_memory_barriers(&image_barriers)
        .buffer_memory_barriers(&buffer_barriers);

    unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ResourceState;
    use ash::vk::Handle;

    #[test]
    fn test_stage_conversion() {
        assert_eq!(
            ResourceState::SHADER_READ.stages.to_vk(),
            vk::PipelineStageFlags2::FRAGMENT_SHADER
                | vk::PipelineStageFlags2::COMPUTE_SHADER
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
        );
        assert_eq!(
            PipelineStages::empty().to_vk(),
            vk::PipelineStageFlags2::NONE
        );
    }

    #[test]
    fn test_access_conversion() {
        assert_eq!(
            ResourceState::STORAGE_READ_WRITE_COMPUTE.access.to_vk(),
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE
        );
        assert_eq!(ResourceState::UNDEFINED.access.to_vk(), vk::AccessFlags2::NONE);
    }

    #[test]
    fn test_layout_conversion() {
        assert_eq!(ImageLayout::PresentSrc.to_vk(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(ImageLayout::General.to_vk(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_image_barrier_fields() {
        let barrier = Barrier::new(
            ImageHandle::from_raw(1),
            ResourceState::STORAGE_WRITE_COMPUTE,
            ResourceState::SHADER_READ,
        );
        let vk_barrier = image_barrier(&barrier, vk::Image::from_raw(42), Format::Rgba16Float);

        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(vk_barrier.src_access_mask, vk::AccessFlags2::SHADER_WRITE);
        assert_eq!(vk_barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(vk_barrier.image.as_raw(), 42);
    }

    #[test]
    fn test_format_conversion() {
        assert_eq!(Format::Rgba16Float.to_vk(), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(
            Format::Depth32Float.aspect_mask(),
            vk::ImageAspectFlags::DEPTH
        );
    }
}
