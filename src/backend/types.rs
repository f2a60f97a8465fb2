//! Common types shared between backends

use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

use crate::backend::traits::{BufferHandle, ImageHandle, SamplerHandle};

/// Two-dimensional image size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale both dimensions by `scale`, rounding down and never below one pixel.
    pub fn scaled(self, scale: f32) -> Self {
        let width = (self.width as f64 * scale as f64).floor() as u32;
        let height = (self.height as f64 * scale as f64).floor() as u32;
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Halve both dimensions, clamped to one pixel.
    pub fn halved(self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
        }
    }

    pub fn min_dimension(&self) -> u32 {
        self.width.min(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when this extent fits inside `other` in both dimensions.
    pub fn fits_within(&self, other: Extent2D) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    /// Number of workgroups needed to cover the extent with `group`-sized tiles.
    pub fn workgroups(&self, group: u32) -> (u32, u32) {
        (
            (self.width + group - 1) / group,
            (self.height + group - 1) / group,
        )
    }
}

impl fmt::Display for Extent2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Extent2D {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Pixel format of a shared or private image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba8Srgb,
    A2b10g10r10Unorm,
    B10g11r11Ufloat,
    Rgba16Float,
    Rgba32Float,
    Rg16Float,
    Rg32Float,
    R16Float,
    R32Float,
    R32Uint,
    Depth32Float,
}

impl Format {
    pub const ALL: [Format; 13] = [
        Format::Rgba8Unorm,
        Format::Bgra8Unorm,
        Format::Rgba8Srgb,
        Format::A2b10g10r10Unorm,
        Format::B10g11r11Ufloat,
        Format::Rgba16Float,
        Format::Rgba32Float,
        Format::Rg16Float,
        Format::Rg32Float,
        Format::R16Float,
        Format::R32Float,
        Format::R32Uint,
        Format::Depth32Float,
    ];

    /// Canonical lowercase name, also accepted by `FromStr`.
    pub fn name(&self) -> &'static str {
        match self {
            Format::Rgba8Unorm => "rgba8_unorm",
            Format::Bgra8Unorm => "bgra8_unorm",
            Format::Rgba8Srgb => "rgba8_srgb",
            Format::A2b10g10r10Unorm => "a2b10g10r10_unorm",
            Format::B10g11r11Ufloat => "b10g11r11_ufloat",
            Format::Rgba16Float => "rgba16_float",
            Format::Rgba32Float => "rgba32_float",
            Format::Rg16Float => "rg16_float",
            Format::Rg32Float => "rg32_float",
            Format::R16Float => "r16_float",
            Format::R32Float => "r32_float",
            Format::R32Uint => "r32_uint",
            Format::Depth32Float => "depth32_float",
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, Format::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Format::R16Float => 2,
            Format::Rgba8Unorm
            | Format::Bgra8Unorm
            | Format::Rgba8Srgb
            | Format::A2b10g10r10Unorm
            | Format::B10g11r11Ufloat
            | Format::Rg16Float
            | Format::R32Float
            | Format::R32Uint
            | Format::Depth32Float => 4,
            Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a format name is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pixel format '{0}'")]
pub struct UnknownFormat(pub String);

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Format::ALL
            .iter()
            .copied()
            .find(|format| format.name() == needle)
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

bitflags! {
    /// Image usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
    }
}

impl ImageUsage {
    /// Usage given to every shared slot image.
    pub const SHARED_SLOT: Self = Self::STORAGE
        .union(Self::COLOR_ATTACHMENT)
        .union(Self::SAMPLED)
        .union(Self::TRANSFER_SRC);
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
    }
}

/// Image descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub extent: Extent2D,
    pub format: Format,
    pub usage: ImageUsage,
    pub mip_levels: u32,
}

impl ImageDescriptor {
    pub fn new(label: impl Into<String>, extent: Extent2D, format: Format, usage: ImageUsage) -> Self {
        Self {
            label: Some(label.into()),
            extent,
            format,
            usage,
            mip_levels: 1,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Texture filtering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

/// Texture address mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    Repeat,
    #[default]
    ClampToEdge,
}

/// Sampler descriptor
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub filter: FilterMode,
    pub address_mode: AddressMode,
}

/// Compute pipeline descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ComputePipelineDescriptor {
    pub label: String,
    pub shader: String,
    pub push_constant_size: u32,
}

/// Graphics pipeline descriptor for fullscreen passes
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDescriptor {
    pub label: String,
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub color_format: Format,
    pub push_constant_size: u32,
}

/// Ray tracing pipeline descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct RayTracingPipelineDescriptor {
    pub label: String,
    pub raygen_shader: String,
    pub miss_shaders: Vec<String>,
    pub closest_hit_shader: String,
    pub max_recursion_depth: u32,
    pub push_constant_size: u32,
}

/// Resource bound at one binding of a binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    StorageImage(ImageHandle),
    SampledImage {
        image: ImageHandle,
        sampler: SamplerHandle,
    },
    StorageBuffer(BufferHandle),
    UniformBuffer(BufferHandle),
}

/// One entry of a binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingEntry {
    pub binding: u32,
    /// Element inside an arrayed binding (0 for plain bindings)
    pub array_element: u32,
    pub resource: BindingResource,
}

impl BindingEntry {
    pub fn new(binding: u32, resource: BindingResource) -> Self {
        Self {
            binding,
            array_element: 0,
            resource,
        }
    }
}

/// Binding table descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct BindingTableDescriptor {
    pub label: String,
    pub entries: Vec<BindingEntry>,
}

/// Load operation for render pass attachments
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    Clear([f32; 4]),
    DontCare,
}

/// Color attachment for a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub image: ImageHandle,
    pub load_op: LoadOp,
    pub store: bool,
}

/// Render pass descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub extent: Extent2D,
    pub color_attachments: Vec<ColorAttachment>,
}

/// An image together with the properties the graph validates against.
///
/// This is a non-owning view: the image belongs to whoever created it (the
/// shared resource table for slot images, a module for private images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Image {
    pub handle: ImageHandle,
    pub extent: Extent2D,
    pub format: Format,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_scaled_floors() {
        let extent = Extent2D::new(1920, 1080);
        assert_eq!(extent.scaled(1.0 / 1.5), Extent2D::new(1280, 720));
        assert_eq!(extent.scaled(1.0 / 1.7), Extent2D::new(1129, 635));
        assert_eq!(extent.scaled(0.5), Extent2D::new(960, 540));
        assert_eq!(Extent2D::new(1, 1).scaled(0.25), Extent2D::new(1, 1));
    }

    #[test]
    fn test_extent_workgroups() {
        assert_eq!(Extent2D::new(1024, 576).workgroups(8), (128, 72));
        assert_eq!(Extent2D::new(17, 9).workgroups(16), (2, 1));
    }

    #[test]
    fn test_format_names_parse() {
        for format in Format::ALL {
            assert_eq!(format.name().parse::<Format>(), Ok(format));
        }
        assert_eq!(" RGBA16_FLOAT ".parse::<Format>(), Ok(Format::Rgba16Float));
        assert!("rgb565".parse::<Format>().is_err());
    }

    #[test]
    fn test_shared_slot_usage() {
        assert!(ImageUsage::SHARED_SLOT.contains(ImageUsage::STORAGE | ImageUsage::SAMPLED));
        assert!(!ImageUsage::SHARED_SLOT.contains(ImageUsage::TRANSFER_DST));
    }
}
