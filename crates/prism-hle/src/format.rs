//! Guest texel formats and their host mappings.

use ash::vk;

/// Guest texel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    None,
    R8,
    Rg8,
    Rgba8,
    Rgba8Srgb,
    Bgra8,
    Bgra8Srgb,
    R16f,
    Rg16f,
    Rgba16f,
    R32f,
    Rg32f,
    Rgba32f,
    R32ui,
    Rgb565,
    Rgb10A2,
    Depth16,
    Depth24Stencil8,
    Depth32f,
    Depth32fStencil8,
    Stencil8,
    Bc1,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
}

/// Which aspects a format carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

impl FormatClass {
    /// The image aspect mask for this class.
    pub fn aspect_mask(self) -> vk::ImageAspectFlags {
        match self {
            Self::Color => vk::ImageAspectFlags::COLOR,
            Self::Depth => vk::ImageAspectFlags::DEPTH,
            Self::Stencil => vk::ImageAspectFlags::STENCIL,
            Self::DepthStencil => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
        }
    }

    /// Whether the format attaches as depth/stencil rather than color.
    pub fn is_depth_stencil(self) -> bool {
        !matches!(self, Self::Color)
    }
}

/// Static properties of a guest format.
#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub bytes_per_block: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub vk_format: vk::Format,
    pub class: FormatClass,
    /// Whether the format is usable as a texture at all.
    pub texture: bool,
}

impl FormatInfo {
    /// Whether the format encodes blocks larger than one texel.
    pub fn is_compressed(&self) -> bool {
        self.block_width > 1 || self.block_height > 1
    }
}

const fn color(bytes_per_block: u32, vk_format: vk::Format) -> FormatInfo {
    FormatInfo {
        bytes_per_block,
        block_width: 1,
        block_height: 1,
        vk_format,
        class: FormatClass::Color,
        texture: true,
    }
}

const fn compressed(bytes_per_block: u32, vk_format: vk::Format) -> FormatInfo {
    FormatInfo {
        bytes_per_block,
        block_width: 4,
        block_height: 4,
        vk_format,
        class: FormatClass::Color,
        texture: true,
    }
}

const fn depth_stencil(
    bytes_per_block: u32,
    vk_format: vk::Format,
    class: FormatClass,
) -> FormatInfo {
    FormatInfo {
        bytes_per_block,
        block_width: 1,
        block_height: 1,
        vk_format,
        class,
        texture: true,
    }
}

impl Format {
    /// Static properties of this format.
    pub const fn info(self) -> FormatInfo {
        match self {
            Self::None => FormatInfo {
                bytes_per_block: 0,
                block_width: 1,
                block_height: 1,
                vk_format: vk::Format::UNDEFINED,
                class: FormatClass::Color,
                texture: false,
            },
            Self::R8 => color(1, vk::Format::R8_UNORM),
            Self::Rg8 => color(2, vk::Format::R8G8_UNORM),
            Self::Rgba8 => color(4, vk::Format::R8G8B8A8_UNORM),
            Self::Rgba8Srgb => color(4, vk::Format::R8G8B8A8_SRGB),
            Self::Bgra8 => color(4, vk::Format::B8G8R8A8_UNORM),
            Self::Bgra8Srgb => color(4, vk::Format::B8G8R8A8_SRGB),
            Self::R16f => color(2, vk::Format::R16_SFLOAT),
            Self::Rg16f => color(4, vk::Format::R16G16_SFLOAT),
            Self::Rgba16f => color(8, vk::Format::R16G16B16A16_SFLOAT),
            Self::R32f => color(4, vk::Format::R32_SFLOAT),
            Self::Rg32f => color(8, vk::Format::R32G32_SFLOAT),
            Self::Rgba32f => color(16, vk::Format::R32G32B32A32_SFLOAT),
            Self::R32ui => color(4, vk::Format::R32_UINT),
            Self::Rgb565 => color(2, vk::Format::R5G6B5_UNORM_PACK16),
            Self::Rgb10A2 => color(4, vk::Format::A2B10G10R10_UNORM_PACK32),
            Self::Depth16 => depth_stencil(2, vk::Format::D16_UNORM, FormatClass::Depth),
            Self::Depth24Stencil8 => {
                depth_stencil(4, vk::Format::D24_UNORM_S8_UINT, FormatClass::DepthStencil)
            }
            Self::Depth32f => depth_stencil(4, vk::Format::D32_SFLOAT, FormatClass::Depth),
            Self::Depth32fStencil8 => depth_stencil(
                8,
                vk::Format::D32_SFLOAT_S8_UINT,
                FormatClass::DepthStencil,
            ),
            Self::Stencil8 => depth_stencil(1, vk::Format::S8_UINT, FormatClass::Stencil),
            Self::Bc1 => compressed(8, vk::Format::BC1_RGBA_UNORM_BLOCK),
            Self::Bc2 => compressed(16, vk::Format::BC2_UNORM_BLOCK),
            Self::Bc3 => compressed(16, vk::Format::BC3_UNORM_BLOCK),
            Self::Bc4 => compressed(8, vk::Format::BC4_UNORM_BLOCK),
            Self::Bc5 => compressed(16, vk::Format::BC5_UNORM_BLOCK),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_formats_use_4x4_blocks() {
        for format in [Format::Bc1, Format::Bc2, Format::Bc3, Format::Bc4, Format::Bc5] {
            let info = format.info();
            assert_eq!(info.block_width, 4);
            assert_eq!(info.block_height, 4);
            assert!(info.is_compressed());
        }
        assert_eq!(Format::Bc1.info().bytes_per_block, 8);
        assert_eq!(Format::Bc3.info().bytes_per_block, 16);
    }

    #[test]
    fn depth_stencil_classes_carry_both_aspects() {
        let info = Format::Depth24Stencil8.info();
        assert!(info.class.is_depth_stencil());
        assert_eq!(
            info.class.aspect_mask(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );

        assert_eq!(
            Format::Depth32f.info().class.aspect_mask(),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(!Format::Rgba8.info().class.is_depth_stencil());
    }

    #[test]
    fn none_is_not_a_texture_format() {
        let info = Format::None.info();
        assert!(!info.texture);
        assert_eq!(info.bytes_per_block, 0);
    }
}
