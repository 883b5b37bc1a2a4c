//! Guest textures.
//!
//! A guest `Texture` is a lightweight handle owning one reference into the
//! device's virtual-texture cache; textures built over the same guest GPU
//! address with compatible shapes share one host resource. The builder
//! carries the guest's full shape description and derives storage size,
//! alignment, and tiling from it.

use crate::device::Device;
use crate::error::{HleError, Result};
use crate::format::Format;
use crate::memory_pool::MemoryPool;
use crate::virtual_texture::TextureHandle;
use ash::vk;
use bitflags::bitflags;
use prism_core::layout::{pitch_size, select_tile_depth, select_tile_height, Extent3d};
use std::sync::Arc;

bitflags! {
    /// Guest texture flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        const DISPLAY = 1 << 0;
        const VIDEO_DECODE = 1 << 1;
        const IMAGE = 1 << 2;
        const COMPRESSIBLE = 1 << 3;
        const LINEAR = 1 << 4;
        const SPARSE = 1 << 5;
        const LINEAR_RENDER_TARGET = 1 << 6;
        const ADAPTIVE_ZCULL = 1 << 7;
        const DEPTH16_PREFER_FAST_CLEAR = 1 << 8;
        const MINIMAL_LAYOUT = 1 << 9;
        const ZCULL_SUPPORT_STENCIL = 1 << 10;
    }
}

impl TextureFlags {
    /// Whether the texture stores texels linearly rather than block-linear.
    pub fn is_linear_layout(self) -> bool {
        self.intersects(Self::LINEAR | Self::LINEAR_RENDER_TARGET)
    }
}

/// Guest texture target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureTarget {
    D1,
    #[default]
    D2,
    D3,
    D1Array,
    D2Array,
    D2Multisample,
    D2MultisampleArray,
    Rectangle,
    Cubemap,
    CubemapArray,
    Buffer,
}

impl TextureTarget {
    /// Whether views of this target address multiple layers.
    pub fn has_layers(self) -> bool {
        matches!(
            self,
            Self::D1Array
                | Self::D2Array
                | Self::D2MultisampleArray
                | Self::Cubemap
                | Self::CubemapArray
        )
    }

    pub fn is_cube(self) -> bool {
        matches!(self, Self::Cubemap | Self::CubemapArray)
    }

    pub fn is_multisample(self) -> bool {
        matches!(self, Self::D2Multisample | Self::D2MultisampleArray)
    }

    /// The host image dimensionality backing this target.
    pub fn image_type(self) -> vk::ImageType {
        match self {
            Self::D1 | Self::D1Array => vk::ImageType::TYPE_1D,
            Self::D3 => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }

    /// The host view dimensionality for an unredirected view.
    pub fn view_type(self) -> vk::ImageViewType {
        match self {
            Self::D1 => vk::ImageViewType::TYPE_1D,
            Self::D1Array => vk::ImageViewType::TYPE_1D_ARRAY,
            Self::D3 => vk::ImageViewType::TYPE_3D,
            Self::D2Array | Self::D2MultisampleArray => vk::ImageViewType::TYPE_2D_ARRAY,
            Self::Cubemap => vk::ImageViewType::CUBE,
            Self::CubemapArray => vk::ImageViewType::CUBE_ARRAY,
            _ => vk::ImageViewType::TYPE_2D,
        }
    }
}

/// One source for a swizzled component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSwizzle {
    Zero,
    One,
    R,
    G,
    B,
    A,
}

impl TextureSwizzle {
    pub fn to_vk(self) -> vk::ComponentSwizzle {
        match self {
            Self::Zero => vk::ComponentSwizzle::ZERO,
            Self::One => vk::ComponentSwizzle::ONE,
            Self::R => vk::ComponentSwizzle::R,
            Self::G => vk::ComponentSwizzle::G,
            Self::B => vk::ComponentSwizzle::B,
            Self::A => vk::ComponentSwizzle::A,
        }
    }
}

/// The full component mapping of a texture or view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSwizzleMapping {
    pub r: TextureSwizzle,
    pub g: TextureSwizzle,
    pub b: TextureSwizzle,
    pub a: TextureSwizzle,
}

impl Default for TextureSwizzleMapping {
    fn default() -> Self {
        Self {
            r: TextureSwizzle::R,
            g: TextureSwizzle::G,
            b: TextureSwizzle::B,
            a: TextureSwizzle::A,
        }
    }
}

impl TextureSwizzleMapping {
    pub fn to_vk(self) -> vk::ComponentMapping {
        vk::ComponentMapping {
            r: self.r.to_vk(),
            g: self.g.to_vk(),
            b: self.b.to_vk(),
            a: self.a.to_vk(),
        }
    }
}

/// How a depth-stencil texture samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureDepthStencilMode {
    #[default]
    Depth,
    Stencil,
}

/// The memory layout family of a texture's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Linear,
    BlockLinear,
}

/// Builder for creating a guest texture.
#[derive(Clone, Default)]
pub struct TextureBuilder {
    pub(crate) device: Option<Arc<Device>>,
    pub(crate) flags: TextureFlags,
    pub(crate) target: TextureTarget,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,
    pub(crate) levels: u32,
    pub(crate) format: Format,
    pub(crate) samples: u32,
    pub(crate) swizzle: TextureSwizzleMapping,
    pub(crate) depth_stencil_mode: TextureDepthStencilMode,
    pub(crate) memory_pool: Option<Arc<MemoryPool>>,
    pub(crate) memory_offset: i64,
    pub(crate) stride: u64,
}

impl TextureBuilder {
    pub fn new() -> Self {
        Self {
            height: 1,
            depth: 1,
            levels: 1,
            samples: 1,
            ..Self::default()
        }
    }

    pub fn set_device(&mut self, device: Arc<Device>) {
        self.device = Some(device);
    }

    pub fn set_flags(&mut self, flags: TextureFlags) {
        self.flags = flags;
    }

    pub fn set_target(&mut self, target: TextureTarget) {
        self.target = target;
    }

    pub fn set_width(&mut self, width: i32) -> Result<()> {
        if width < 0 {
            return Err(HleError::InvalidArgument("width < 0"));
        }
        self.width = width as u32;
        Ok(())
    }

    pub fn set_height(&mut self, height: i32) -> Result<()> {
        if height < 0 {
            return Err(HleError::InvalidArgument("height < 0"));
        }
        self.height = height as u32;
        Ok(())
    }

    pub fn set_depth(&mut self, depth: i32) -> Result<()> {
        if depth < 0 {
            return Err(HleError::InvalidArgument("depth < 0"));
        }
        self.depth = depth as u32;
        Ok(())
    }

    pub fn set_size_1d(&mut self, width: i32) -> Result<()> {
        self.set_width(width)
    }

    pub fn set_size_2d(&mut self, width: i32, height: i32) -> Result<()> {
        self.set_width(width)?;
        self.set_height(height)
    }

    pub fn set_size_3d(&mut self, width: i32, height: i32, depth: i32) -> Result<()> {
        self.set_width(width)?;
        self.set_height(height)?;
        self.set_depth(depth)
    }

    pub fn set_levels(&mut self, levels: i32) -> Result<()> {
        if levels < 0 {
            return Err(HleError::InvalidArgument("levels < 0"));
        }
        self.levels = levels as u32;
        Ok(())
    }

    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    pub fn set_samples(&mut self, samples: i32) -> Result<()> {
        if !matches!(samples, 1 | 2 | 4 | 8 | 16) {
            return Err(HleError::InvalidArgument("invalid sample count"));
        }
        self.samples = samples as u32;
        Ok(())
    }

    pub fn set_swizzle(
        &mut self,
        r: TextureSwizzle,
        g: TextureSwizzle,
        b: TextureSwizzle,
        a: TextureSwizzle,
    ) {
        self.swizzle = TextureSwizzleMapping { r, g, b, a };
    }

    pub fn set_depth_stencil_mode(&mut self, mode: TextureDepthStencilMode) {
        self.depth_stencil_mode = mode;
    }

    pub fn set_storage(&mut self, pool: Arc<MemoryPool>, offset: i64) {
        self.memory_pool = Some(pool);
        self.memory_offset = offset;
    }

    pub fn set_stride(&mut self, stride: i64) -> Result<()> {
        if stride < 0 {
            return Err(HleError::InvalidArgument("stride < 0"));
        }
        self.stride = stride as u64;
        Ok(())
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn flags(&self) -> TextureFlags {
        self.flags
    }

    pub fn target(&self) -> TextureTarget {
        self.target
    }

    pub fn width(&self) -> i32 {
        self.width as i32
    }

    pub fn height(&self) -> i32 {
        self.height as i32
    }

    pub fn depth(&self) -> i32 {
        self.depth as i32
    }

    pub fn levels(&self) -> i32 {
        self.levels as i32
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn samples(&self) -> i32 {
        self.samples as i32
    }

    pub fn swizzle(&self) -> TextureSwizzleMapping {
        self.swizzle
    }

    pub fn depth_stencil_mode(&self) -> TextureDepthStencilMode {
        self.depth_stencil_mode
    }

    pub fn memory_pool(&self) -> Option<&Arc<MemoryPool>> {
        self.memory_pool.as_ref()
    }

    pub fn memory_offset(&self) -> i64 {
        self.memory_offset
    }

    pub fn stride(&self) -> i64 {
        self.stride as i64
    }

    /// The sample distribution across the X/Y axes for multisample targets.
    pub(crate) fn axis_samples(&self) -> (u32, u32) {
        if !self.target.is_multisample() {
            return (1, 1);
        }

        match self.samples {
            1 | 2 => (1, 1),
            4 => (2, 2),
            8 => (4, 2),
            16 => (4, 4),
            _ => (1, 1),
        }
    }

    /// The selected GOB-block height for this texture's storage.
    pub fn tile_height(&self) -> u8 {
        if self.flags.contains(TextureFlags::VIDEO_DECODE) {
            return 2;
        }

        if self.flags.contains(TextureFlags::LINEAR)
            || matches!(
                self.target,
                TextureTarget::D1 | TextureTarget::D1Array | TextureTarget::Buffer
            )
        {
            return 1;
        }

        let (_, samples_y) = self.axis_samples();
        let info = self.format.info();
        select_tile_height(self.height * samples_y, info.block_height)
    }

    /// The selected GOB-block depth for this texture's storage.
    pub fn tile_depth(&self) -> u8 {
        if self.target != TextureTarget::D3 {
            return 1;
        }

        select_tile_depth(self.depth)
    }

    /// Bytes of pool storage the texture occupies.
    pub fn storage_size(&self) -> Result<u64> {
        let info = self.format.info();
        if !info.texture {
            return Ok(0);
        }

        if self.target == TextureTarget::Buffer {
            return Ok(u64::from(self.width) * u64::from(info.bytes_per_block));
        }

        if self.flags.contains(TextureFlags::LINEAR) {
            if self.stride == 0 {
                return Err(HleError::InvalidArgument("linear texture with zero stride"));
            }
            return Ok(pitch_size(self.stride, self.height));
        }

        let is_3d = self.target == TextureTarget::D3;
        let layer_count = if is_3d { 1 } else { self.depth };
        let depth = if is_3d { self.depth } else { 1 };

        let (samples_x, samples_y) = self.axis_samples();
        let layer_size = prism_core::layout::block_linear_layer_size(
            Extent3d::new(self.width * samples_x, self.height * samples_y, depth),
            info.block_width,
            info.block_height,
            info.bytes_per_block,
            self.tile_height(),
            self.tile_depth(),
            self.levels,
            layer_count > 1,
        );

        Ok(layer_size * u64::from(layer_count))
    }

    /// Required pool-offset alignment for the texture's storage.
    pub fn storage_alignment(&self) -> u64 {
        if self.target == TextureTarget::Buffer {
            let bytes_per_block = u64::from(self.format.info().bytes_per_block);
            // Reduced alignment for 12-byte-per-texel formats
            return if bytes_per_block == 12 {
                4
            } else {
                bytes_per_block
            };
        }

        if self.flags.contains(TextureFlags::LINEAR_RENDER_TARGET) {
            0x80
        } else if self.flags.contains(TextureFlags::LINEAR) {
            0x20
        } else {
            0x200
        }
    }

    /// The memory layout family of the texture's storage.
    pub fn storage_class(&self) -> StorageClass {
        if self.flags.is_linear_layout() || self.target == TextureTarget::Buffer {
            StorageClass::Linear
        } else {
            StorageClass::BlockLinear
        }
    }

    /// The guest GPU address the texture's storage starts at.
    pub(crate) fn address(&self) -> Result<u64> {
        let pool = self
            .memory_pool
            .as_ref()
            .ok_or(HleError::InvalidArgument("texture has no memory pool"))?;
        Ok(pool.buffer_address()?.wrapping_add(self.memory_offset as u64))
    }
}

/// A format/subresource reinterpretation of a texture.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureView {
    levels: Option<(u32, u32)>,
    layers: Option<(u32, u32)>,
    format: Option<Format>,
    swizzle: Option<TextureSwizzleMapping>,
    depth_stencil_mode: Option<TextureDepthStencilMode>,
    target: Option<TextureTarget>,
}

impl TextureView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_levels(&mut self, base_level: i32, levels: i32) -> Result<()> {
        if base_level < 0 || levels < 0 {
            return Err(HleError::InvalidArgument("negative level range"));
        }
        self.levels = Some((base_level as u32, levels as u32));
        Ok(())
    }

    pub fn set_layers(&mut self, min_layer: i32, layers: i32) -> Result<()> {
        if min_layer < 0 || layers < 0 {
            return Err(HleError::InvalidArgument("negative layer range"));
        }
        self.layers = Some((min_layer as u32, layers as u32));
        Ok(())
    }

    pub fn set_format(&mut self, format: Format) {
        self.format = Some(format);
    }

    pub fn set_swizzle(
        &mut self,
        r: TextureSwizzle,
        g: TextureSwizzle,
        b: TextureSwizzle,
        a: TextureSwizzle,
    ) {
        self.swizzle = Some(TextureSwizzleMapping { r, g, b, a });
    }

    pub fn set_depth_stencil_mode(&mut self, mode: TextureDepthStencilMode) {
        self.depth_stencil_mode = Some(mode);
    }

    pub fn set_target(&mut self, target: TextureTarget) {
        self.target = Some(target);
    }

    pub fn levels(&self) -> Option<(u32, u32)> {
        self.levels
    }

    pub fn layers(&self) -> Option<(u32, u32)> {
        self.layers
    }

    pub fn format(&self) -> Option<Format> {
        self.format
    }

    pub fn swizzle(&self) -> Option<TextureSwizzleMapping> {
        self.swizzle
    }

    pub fn depth_stencil_mode(&self) -> Option<TextureDepthStencilMode> {
        self.depth_stencil_mode
    }

    pub fn target(&self) -> Option<TextureTarget> {
        self.target
    }
}

/// A guest texture handle.
pub struct Texture {
    device: Arc<Device>,
    handle: TextureHandle,
    flags: TextureFlags,
    target: TextureTarget,
    width: u32,
    height: u32,
    depth: u32,
    levels: u32,
    format: Format,
    samples: u32,
    swizzle: TextureSwizzleMapping,
    depth_stencil_mode: TextureDepthStencilMode,
    memory_pool: Arc<MemoryPool>,
    memory_offset: i64,
    stride: u64,
    storage_size: u64,
    storage_class: StorageClass,
    address: u64,
    debug_label: Option<String>,
}

impl Texture {
    /// Create a texture, sharing a cached host resource when a compatible
    /// one is already live at the same address.
    pub fn new(builder: &TextureBuilder) -> Result<Self> {
        let device = builder
            .device
            .clone()
            .ok_or(HleError::InvalidArgument("texture has no device"))?;
        let memory_pool = builder
            .memory_pool
            .clone()
            .ok_or(HleError::InvalidArgument("texture has no memory pool"))?;

        let storage_size = builder.storage_size()?;
        let address = builder.address()?;

        let handle = device
            .virtual_textures()
            .lock()
            .find_or_create(device.context(), builder, address)?;

        Ok(Self {
            device,
            handle,
            flags: builder.flags,
            target: builder.target,
            width: builder.width,
            height: builder.height,
            depth: builder.depth,
            levels: builder.levels,
            format: builder.format,
            samples: builder.samples,
            swizzle: builder.swizzle,
            depth_stencil_mode: builder.depth_stencil_mode,
            memory_pool,
            memory_offset: builder.memory_offset,
            stride: builder.stride,
            storage_size,
            storage_class: builder.storage_class(),
            address,
            debug_label: None,
        })
    }

    pub fn set_debug_label(&mut self, label: impl Into<String>) {
        self.debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    /// Whether two textures alias the same cached host resource.
    pub fn compare(&self, other: &Self) -> bool {
        self.handle == other.handle
    }

    /// Create (or fetch the memoized) host image view for `view`.
    pub fn image_view(&self, view: &TextureView) -> Result<vk::ImageView> {
        self.device
            .virtual_textures()
            .lock()
            .image_view(self.device.context(), self.handle, self, view)
    }

    /// Create (or fetch the memoized) host buffer view over the storage.
    pub fn buffer_view(&self, format: Format) -> Result<vk::BufferView> {
        self.device
            .virtual_textures()
            .lock()
            .buffer_view(self.device.context(), self.handle, format, self.storage_size)
    }

    pub(crate) fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn flags(&self) -> TextureFlags {
        self.flags
    }

    pub fn target(&self) -> TextureTarget {
        self.target
    }

    pub fn width(&self) -> i32 {
        self.width as i32
    }

    pub fn height(&self) -> i32 {
        self.height as i32
    }

    pub fn depth(&self) -> i32 {
        self.depth as i32
    }

    pub fn levels(&self) -> i32 {
        self.levels as i32
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn samples(&self) -> i32 {
        self.samples as i32
    }

    pub fn swizzle(&self) -> TextureSwizzleMapping {
        self.swizzle
    }

    pub fn depth_stencil_mode(&self) -> TextureDepthStencilMode {
        self.depth_stencil_mode
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    pub fn memory_offset(&self) -> i64 {
        self.memory_offset
    }

    pub fn stride(&self) -> i64 {
        self.stride as i64
    }

    pub fn storage_size(&self) -> u64 {
        self.storage_size
    }

    pub fn storage_class(&self) -> StorageClass {
        self.storage_class
    }

    /// The guest GPU address of the texture's storage.
    pub fn address(&self) -> u64 {
        self.address
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.device
            .virtual_textures()
            .lock()
            .put(self.device.context(), self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_dimensions_are_rejected() {
        let mut builder = TextureBuilder::new();
        assert!(builder.set_width(-1).is_err());
        assert!(builder.set_size_2d(64, -1).is_err());
        assert!(builder.set_size_3d(4, 4, -4).is_err());
        assert!(builder.set_stride(-8).is_err());
        assert!(builder.set_levels(-2).is_err());
        assert!(builder.set_width(64).is_ok());
    }

    #[test]
    fn linear_storage_requires_stride() {
        let mut builder = TextureBuilder::new();
        builder.set_flags(TextureFlags::LINEAR);
        builder.set_format(Format::Rgba8);
        builder.set_size_2d(64, 32).unwrap();

        assert!(matches!(
            builder.storage_size(),
            Err(HleError::InvalidArgument(_))
        ));

        builder.set_stride(256).unwrap();
        assert_eq!(builder.storage_size().unwrap(), 256 * 32);
    }

    #[test]
    fn buffer_storage_is_width_times_block() {
        let mut builder = TextureBuilder::new();
        builder.set_target(TextureTarget::Buffer);
        builder.set_format(Format::R32f);
        builder.set_size_1d(1000).unwrap();

        assert_eq!(builder.storage_size().unwrap(), 4000);
        assert_eq!(builder.tile_height(), 1);
    }

    #[test]
    fn block_linear_storage_matches_layout_math() {
        let mut builder = TextureBuilder::new();
        builder.set_format(Format::Rgba8);
        builder.set_size_2d(64, 64).unwrap();

        // 64x64 RGBA8 fills its GOBs exactly
        assert_eq!(builder.storage_size().unwrap(), 64 * 64 * 4);
        assert_eq!(builder.tile_height(), 8);
        assert_eq!(builder.tile_depth(), 1);
    }

    #[test]
    fn none_format_has_no_storage() {
        let mut builder = TextureBuilder::new();
        builder.set_size_2d(64, 64).unwrap();
        assert_eq!(builder.storage_size().unwrap(), 0);
    }

    #[test]
    fn video_decode_forces_two_gob_tiles() {
        let mut builder = TextureBuilder::new();
        builder.set_flags(TextureFlags::VIDEO_DECODE);
        builder.set_format(Format::Rgba8);
        builder.set_size_2d(1920, 1080).unwrap();
        assert_eq!(builder.tile_height(), 2);
    }

    #[test]
    fn storage_alignment_follows_layout() {
        let mut builder = TextureBuilder::new();
        builder.set_format(Format::Rgba8);
        assert_eq!(builder.storage_alignment(), 0x200);

        builder.set_flags(TextureFlags::LINEAR);
        assert_eq!(builder.storage_alignment(), 0x20);

        builder.set_flags(TextureFlags::LINEAR_RENDER_TARGET);
        assert_eq!(builder.storage_alignment(), 0x80);

        builder.set_flags(TextureFlags::empty());
        builder.set_target(TextureTarget::Buffer);
        assert_eq!(builder.storage_alignment(), 4);
    }

    #[test]
    fn multisample_axis_distribution() {
        let mut builder = TextureBuilder::new();
        builder.set_target(TextureTarget::D2Multisample);
        builder.set_samples(8).unwrap();
        assert_eq!(builder.axis_samples(), (4, 2));

        assert!(builder.set_samples(3).is_err());

        builder.set_target(TextureTarget::D2);
        assert_eq!(builder.axis_samples(), (1, 1));
    }

    #[test]
    fn storage_class_derivation() {
        let mut builder = TextureBuilder::new();
        assert_eq!(builder.storage_class(), StorageClass::BlockLinear);

        builder.set_flags(TextureFlags::LINEAR);
        assert_eq!(builder.storage_class(), StorageClass::Linear);
    }

    #[test]
    fn view_records_only_written_members() {
        let mut view = TextureView::new();
        assert!(view.format().is_none());
        assert!(view.levels().is_none());

        view.set_format(Format::Bgra8);
        view.set_levels(1, 2).unwrap();
        assert_eq!(view.format(), Some(Format::Bgra8));
        assert_eq!(view.levels(), Some((1, 2)));

        assert!(view.set_layers(-1, 2).is_err());
    }
}
