//! Resource state tags: pipeline stages, access mode and image layout.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages that produce or consume a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_SHADER = 1 << 2;
        const FRAGMENT_SHADER = 1 << 3;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 4;
        const COMPUTE_SHADER = 1 << 5;
        const RAY_TRACING_SHADER = 1 << 6;
        const TRANSFER = 1 << 7;
        const BOTTOM_OF_PIPE = 1 << 8;
        const ALL_COMMANDS = 1 << 9;
    }
}

bitflags! {
    /// How a resource is accessed by the stages above.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const UNIFORM_READ = 1 << 1;
        const SHADER_READ = 1 << 2;
        const SHADER_WRITE = 1 << 3;
        const COLOR_ATTACHMENT_READ = 1 << 4;
        const COLOR_ATTACHMENT_WRITE = 1 << 5;
        const TRANSFER_READ = 1 << 6;
        const TRANSFER_WRITE = 1 << 7;
        const MEMORY_READ = 1 << 8;
        const MEMORY_WRITE = 1 << 9;
    }
}

impl AccessFlags {
    const WRITES: Self = Self::SHADER_WRITE
        .union(Self::COLOR_ATTACHMENT_WRITE)
        .union(Self::TRANSFER_WRITE)
        .union(Self::MEMORY_WRITE);

    /// True if any write access is included.
    pub fn is_write(&self) -> bool {
        self.intersects(Self::WRITES)
    }

    /// True if any read access is included.
    pub fn is_read(&self) -> bool {
        self.intersects(!Self::WRITES)
    }
}

/// Memory layout of an image. Buffers always stay `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    /// Contents undefined; the initial layout of every new image.
    #[default]
    Undefined,
    General,
    ColorAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// The `{stage, access, layout}` tag attached to every tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceState {
    pub stages: PipelineStages,
    pub access: AccessFlags,
    pub layout: ImageLayout,
}

impl ResourceState {
    pub const fn new(stages: PipelineStages, access: AccessFlags, layout: ImageLayout) -> Self {
        Self {
            stages,
            access,
            layout,
        }
    }

    /// Freshly created resource, nothing has touched it yet.
    pub const UNDEFINED: Self = Self::new(
        PipelineStages::TOP_OF_PIPE,
        AccessFlags::empty(),
        ImageLayout::Undefined,
    );

    /// Storage image written by a compute dispatch.
    pub const STORAGE_WRITE_COMPUTE: Self = Self::new(
        PipelineStages::COMPUTE_SHADER,
        AccessFlags::SHADER_WRITE,
        ImageLayout::General,
    );

    /// Storage image a compute dispatch just wrote and the next one samples and writes again.
    pub const STORAGE_READ_WRITE_COMPUTE: Self = Self::new(
        PipelineStages::COMPUTE_SHADER,
        AccessFlags::SHADER_READ.union(AccessFlags::SHADER_WRITE),
        ImageLayout::General,
    );

    /// Storage image written by the ray tracing stages.
    pub const STORAGE_WRITE_RAY_TRACING: Self = Self::new(
        PipelineStages::RAY_TRACING_SHADER,
        AccessFlags::SHADER_WRITE,
        ImageLayout::General,
    );

    /// Readable by any later shader stage. Intermediate slots end in this state.
    pub const SHADER_READ: Self = Self::new(
        PipelineStages::FRAGMENT_SHADER
            .union(PipelineStages::COMPUTE_SHADER)
            .union(PipelineStages::RAY_TRACING_SHADER),
        AccessFlags::SHADER_READ,
        ImageLayout::ShaderReadOnly,
    );

    /// Render target of a graphics pass.
    pub const COLOR_ATTACHMENT_WRITE: Self = Self::new(
        PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        AccessFlags::COLOR_ATTACHMENT_WRITE,
        ImageLayout::ColorAttachment,
    );

    /// The single state slot 0 is left in once a frame has been recorded.
    pub const PRESENT: Self = Self::new(
        PipelineStages::FRAGMENT_SHADER.union(PipelineStages::TRANSFER),
        AccessFlags::MEMORY_READ,
        ImageLayout::PresentSrc,
    );

    /// Buffer cleared or filled by a transfer command.
    pub const BUFFER_TRANSFER_WRITE: Self = Self::new(
        PipelineStages::TRANSFER,
        AccessFlags::TRANSFER_WRITE,
        ImageLayout::General,
    );

    /// Buffer read and atomically written by compute dispatches.
    pub const BUFFER_COMPUTE_READ_WRITE: Self = Self::new(
        PipelineStages::COMPUTE_SHADER,
        AccessFlags::SHADER_READ.union(AccessFlags::SHADER_WRITE),
        ImageLayout::General,
    );

    /// Buffer only read by compute dispatches.
    pub const BUFFER_COMPUTE_READ: Self = Self::new(
        PipelineStages::COMPUTE_SHADER,
        AccessFlags::SHADER_READ,
        ImageLayout::General,
    );

    /// Buffer read by fragment shaders.
    pub const BUFFER_FRAGMENT_READ: Self = Self::new(
        PipelineStages::FRAGMENT_SHADER,
        AccessFlags::SHADER_READ.union(AccessFlags::UNIFORM_READ),
        ImageLayout::General,
    );

    pub fn is_write(&self) -> bool {
        self.access.is_write()
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_read_write_classification() {
        assert!(AccessFlags::SHADER_WRITE.is_write());
        assert!(!AccessFlags::SHADER_WRITE.is_read());
        assert!(AccessFlags::SHADER_READ.is_read());
        assert!(!AccessFlags::SHADER_READ.is_write());

        let both = AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE;
        assert!(both.is_read() && both.is_write());
        assert!(!AccessFlags::empty().is_read());
        assert!(!AccessFlags::empty().is_write());
    }

    #[test]
    fn test_preset_states() {
        assert_eq!(ResourceState::default(), ResourceState::UNDEFINED);
        assert!(ResourceState::STORAGE_WRITE_COMPUTE.is_write());
        assert!(ResourceState::STORAGE_READ_WRITE_COMPUTE.is_write());
        assert!(!ResourceState::SHADER_READ.is_write());
        assert!(!ResourceState::PRESENT.is_write());
        assert_eq!(ResourceState::PRESENT.layout, ImageLayout::PresentSrc);
    }
}
