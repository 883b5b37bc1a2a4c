//! The de-duplicating virtual-texture cache.
//!
//! Guest textures are descriptions of memory, not owners of it: several
//! guest textures may alias the same guest GPU address with compatible
//! shapes, and memory may be reinterpreted under a different format at the
//! same address. The cache keys host resources by address, shares one
//! `VirtualTexture` between all compatible guest textures via refcounting,
//! and owns the lazily-created format aliases and views over the one
//! underlying allocation.

use crate::arena::{Arena, Handle};
use crate::error::{HleError, Result};
use crate::format::{Format, FormatClass};
use crate::texture::{
    StorageClass, Texture, TextureBuilder, TextureDepthStencilMode, TextureFlags, TextureTarget,
    TextureView,
};
use ash::vk;
use hashbrown::HashMap;
use prism_gpu::{create_aliasing_buffer, GpuContext, ImageMemory};

/// Stable identity of a cached virtual texture.
pub type TextureHandle = Handle;

/// The shape half of the cache key.
///
/// Same address does not imply same texture: the guest is free to
/// reinterpret memory, and only textures agreeing on all of this share a
/// host resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TextureShape {
    pub flags: TextureFlags,
    pub target: TextureTarget,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u32,
    pub format: Format,
    pub samples: u32,
    pub stride: u64,
}

impl TextureShape {
    pub fn from_builder(builder: &TextureBuilder) -> Self {
        Self {
            flags: builder.flags,
            target: builder.target,
            width: builder.width,
            height: builder.height,
            depth: builder.depth,
            levels: builder.levels,
            format: builder.format,
            samples: builder.samples,
            stride: builder.stride,
        }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self == other
    }
}

/// Identity of one format/type reinterpretation image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AliasKey {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub image_type: vk::ImageType,
}

/// Identity of one memoized image view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ImageViewKey {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub components: [vk::ComponentSwizzle; 4],
    pub aspect: vk::ImageAspectFlags,
    pub base_level: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

/// Identity of one memoized buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BufferViewKey {
    pub format: vk::Format,
    pub offset: u64,
    pub size: u64,
}

/// One reinterpretation image plus its memoized views.
pub(crate) struct ImageAlias {
    key: AliasKey,
    image: vk::Image,
    views: HashMap<ImageViewKey, vk::ImageView>,
}

/// A refcounted host resource backing one or more guest textures.
pub(crate) struct VirtualTexture {
    pub(crate) address: u64,
    pub(crate) shape: TextureShape,
    pub(crate) storage_size: u64,
    pub(crate) storage_class: StorageClass,
    pub(crate) tile_height: u8,
    pub(crate) tile_depth: u8,
    pub(crate) refs: u32,
    /// Every format the texture has been reinterpreted under so far.
    format_list: Vec<vk::Format>,
    /// Buffer aliasing the pool's imported memory at the texture's offset.
    memory_buffer: vk::Buffer,
    /// The pool memory behind `memory_buffer`; linear images bind here.
    pool_memory: vk::DeviceMemory,
    pool_offset: u64,
    /// Dedicated allocation for tiled images. Block-linear storage cannot
    /// be aliased byte-for-byte onto linear CPU-imported memory.
    image_memory: Option<ImageMemory>,
    images: Vec<ImageAlias>,
    buffer_views: HashMap<BufferViewKey, vk::BufferView>,
}

impl VirtualTexture {
    fn new(context: &GpuContext, builder: &TextureBuilder, address: u64) -> Result<Self> {
        let shape = TextureShape::from_builder(builder);
        let storage_size = builder.storage_size()?;
        if storage_size == 0 {
            return Err(HleError::InvalidArgument("texture has no storage"));
        }

        let pool = builder
            .memory_pool()
            .ok_or(HleError::InvalidArgument("texture has no memory pool"))?;
        let imported = pool.imported().ok_or(HleError::Unsupported(
            "virtual pools cannot back textures",
        ))?;
        let pool_offset = builder.memory_offset() as u64;

        let mut texture = Self {
            address,
            shape,
            storage_size,
            storage_class: builder.storage_class(),
            tile_height: builder.tile_height(),
            tile_depth: builder.tile_depth(),
            refs: 1,
            format_list: vec![shape.format.info().vk_format],
            memory_buffer: vk::Buffer::null(),
            pool_memory: imported.memory,
            pool_offset,
            image_memory: None,
            images: Vec::new(),
            buffer_views: HashMap::new(),
        };

        if texture.storage_class == StorageClass::BlockLinear {
            let create_info = texture.image_alias_create_info(&texture.base_alias_key());
            let memory = context
                .allocator()
                .lock()
                .allocate_image_memory(&create_info, "virtual-texture")?;
            texture.image_memory = Some(memory);
        }

        match create_aliasing_buffer(context, imported.memory, pool_offset, storage_size) {
            Ok(buffer) => texture.memory_buffer = buffer,
            Err(e) => {
                if let Some(mut memory) = texture.image_memory.take() {
                    let _ = context.allocator().lock().free_image_memory(&mut memory);
                }
                return Err(e.into());
            }
        }

        Ok(texture)
    }

    fn base_alias_key(&self) -> AliasKey {
        AliasKey {
            format: self.shape.format,
            width: self.shape.width,
            height: self.shape.height,
            image_type: self.shape.target.image_type(),
        }
    }

    /// Host image-creation parameters for one reinterpretation alias.
    fn image_alias_create_info(&self, key: &AliasKey) -> vk::ImageCreateInfo<'static> {
        let info = key.format.info();
        let shape = &self.shape;

        let mut flags = vk::ImageCreateFlags::empty();
        if self.format_list.len() > 1 {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }
        if shape.target.is_cube() {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if key.image_type == vk::ImageType::TYPE_3D {
            flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
        }

        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::SAMPLED;
        if info.class.is_depth_stencil() {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if shape.flags.contains(TextureFlags::IMAGE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let is_3d = key.image_type == vk::ImageType::TYPE_3D;
        let depth = if is_3d { shape.depth } else { 1 };
        let array_layers = if !is_3d && shape.target.has_layers() {
            shape.depth.max(1)
        } else {
            1
        };

        let tiling = if self.storage_class == StorageClass::Linear {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        };

        vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(key.image_type)
            .format(info.vk_format)
            .extent(vk::Extent3D {
                width: key.width,
                height: key.height,
                depth,
            })
            .mip_levels(shape.levels)
            .array_layers(array_layers)
            .samples(sample_count_flags(shape.samples))
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }

    /// Find or create the alias image for `key`, returning its index.
    fn ensure_image_alias(&mut self, context: &GpuContext, key: &AliasKey) -> Result<usize> {
        if let Some(index) = self.images.iter().position(|alias| alias.key == *key) {
            return Ok(index);
        }

        let vk_format = key.format.info().vk_format;
        if !self.format_list.contains(&vk_format) {
            self.format_list.push(vk_format);
        }

        let create_info = self.image_alias_create_info(key);
        let device = context.device();
        let image = unsafe { device.create_image(&create_info, None) }
            .map_err(|e| HleError::Gpu(e.into()))?;

        let bind_result = match &self.image_memory {
            Some(memory) => unsafe { memory.bind_image(device, image).map_err(HleError::Gpu) },
            None => unsafe {
                device
                    .bind_image_memory(image, self.pool_memory, self.pool_offset)
                    .map_err(|e| HleError::Gpu(e.into()))
            },
        };
        if let Err(e) = bind_result {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }

        self.images.push(ImageAlias {
            key: *key,
            image,
            views: HashMap::new(),
        });
        Ok(self.images.len() - 1)
    }

    /// Find or create the memoized image view for `view_key` on the alias
    /// identified by `alias_key`.
    fn image_view(
        &mut self,
        context: &GpuContext,
        alias_key: &AliasKey,
        view_key: &ImageViewKey,
    ) -> Result<vk::ImageView> {
        let index = self.ensure_image_alias(context, alias_key)?;
        if let Some(&view) = self.images[index].views.get(view_key) {
            return Ok(view);
        }

        let create_info = vk::ImageViewCreateInfo::default()
            .image(self.images[index].image)
            .view_type(view_key.view_type)
            .format(view_key.format)
            .components(vk::ComponentMapping {
                r: view_key.components[0],
                g: view_key.components[1],
                b: view_key.components[2],
                a: view_key.components[3],
            })
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(view_key.aspect)
                    .base_mip_level(view_key.base_level)
                    .level_count(view_key.level_count)
                    .base_array_layer(view_key.base_layer)
                    .layer_count(view_key.layer_count),
            );

        let view = unsafe { context.device().create_image_view(&create_info, None) }
            .map_err(|e| HleError::Gpu(e.into()))?;
        self.images[index].views.insert(*view_key, view);
        Ok(view)
    }

    /// Find or create the memoized buffer view for `key`.
    fn buffer_view(&mut self, context: &GpuContext, key: &BufferViewKey) -> Result<vk::BufferView> {
        if let Some(&view) = self.buffer_views.get(key) {
            return Ok(view);
        }

        let create_info = vk::BufferViewCreateInfo::default()
            .buffer(self.memory_buffer)
            .format(key.format)
            .offset(key.offset)
            .range(key.size);

        let view = unsafe { context.device().create_buffer_view(&create_info, None) }
            .map_err(|e| HleError::Gpu(e.into()))?;
        self.buffer_views.insert(*key, view);
        Ok(view)
    }

    /// Release every host object the texture owns.
    fn destroy(&mut self, context: &GpuContext) {
        let device = context.device();
        unsafe {
            for alias in self.images.drain(..) {
                for (_, view) in alias.views {
                    device.destroy_image_view(view, None);
                }
                device.destroy_image(alias.image, None);
            }
            for (_, view) in self.buffer_views.drain() {
                device.destroy_buffer_view(view, None);
            }
            device.destroy_buffer(self.memory_buffer, None);
        }
        self.memory_buffer = vk::Buffer::null();

        if let Some(mut memory) = self.image_memory.take() {
            let _ = context.allocator().lock().free_image_memory(&mut memory);
        }
    }
}

/// The address-keyed cache of live virtual textures.
///
/// Must be externally locked; the owning device wraps it in a mutex since
/// guest resource construction may happen on any thread.
pub struct VirtualTextureManager {
    textures: Arena<VirtualTexture>,
    by_address: HashMap<u64, Vec<TextureHandle>>,
}

impl Default for VirtualTextureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTextureManager {
    pub fn new() -> Self {
        Self {
            textures: Arena::new(),
            by_address: HashMap::new(),
        }
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Find a compatible live entry at `address` or create a new one.
    pub(crate) fn find_or_create(
        &mut self,
        context: &GpuContext,
        builder: &TextureBuilder,
        address: u64,
    ) -> Result<TextureHandle> {
        let shape = TextureShape::from_builder(builder);

        if let Some(handle) = self.find_compatible(address, &shape) {
            self.acquire(handle);
            tracing::trace!(address, "virtual texture cache hit");
            return Ok(handle);
        }

        let texture = VirtualTexture::new(context, builder, address)?;
        tracing::trace!(
            address,
            size = texture.storage_size,
            tile_height = texture.tile_height,
            tile_depth = texture.tile_depth,
            "virtual texture created"
        );
        Ok(self.insert(address, texture))
    }

    /// Drop one reference; destroys the entry when the last goes away.
    pub(crate) fn put(&mut self, context: &GpuContext, handle: TextureHandle) {
        if let Some(mut texture) = self.release(handle) {
            tracing::trace!(address = texture.address, "virtual texture destroyed");
            texture.destroy(context);
        }
    }

    fn find_compatible(&self, address: u64, shape: &TextureShape) -> Option<TextureHandle> {
        self.by_address.get(&address)?.iter().copied().find(|&handle| {
            self.textures
                .get(handle)
                .is_some_and(|texture| texture.shape.is_compatible(shape))
        })
    }

    fn acquire(&mut self, handle: TextureHandle) {
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.refs += 1;
        }
    }

    fn insert(&mut self, address: u64, texture: VirtualTexture) -> TextureHandle {
        let handle = self.textures.insert(texture);
        self.by_address.entry(address).or_default().push(handle);
        handle
    }

    /// Drop one reference; returns the entry if it reached zero.
    fn release(&mut self, handle: TextureHandle) -> Option<VirtualTexture> {
        let texture = self.textures.get_mut(handle)?;
        texture.refs -= 1;
        if texture.refs > 0 {
            return None;
        }

        let texture = self.textures.remove(handle)?;
        if let Some(bucket) = self.by_address.get_mut(&texture.address) {
            bucket.retain(|&h| h != handle);
            if bucket.is_empty() {
                self.by_address.remove(&texture.address);
            }
        }
        Some(texture)
    }

    /// Resolve a guest view request into a host image view.
    pub(crate) fn image_view(
        &mut self,
        context: &GpuContext,
        handle: TextureHandle,
        texture: &Texture,
        view: &TextureView,
    ) -> Result<vk::ImageView> {
        let format = view.format().unwrap_or(texture.format());
        let target = view.target().unwrap_or(texture.target());
        let swizzle = view.swizzle().unwrap_or(texture.swizzle()).to_vk();
        let (base_level, level_count) = view
            .levels()
            .unwrap_or((0, texture.levels() as u32));
        let default_layers = if target.has_layers() {
            texture.depth() as u32
        } else {
            1
        };
        let (base_layer, layer_count) = view.layers().unwrap_or((0, default_layers));

        let info = format.info();
        let aspect = if info.class == FormatClass::DepthStencil {
            match view
                .depth_stencil_mode()
                .unwrap_or(texture.depth_stencil_mode())
            {
                TextureDepthStencilMode::Depth => vk::ImageAspectFlags::DEPTH,
                TextureDepthStencilMode::Stencil => vk::ImageAspectFlags::STENCIL,
            }
        } else {
            info.class.aspect_mask()
        };

        let entry = self
            .textures
            .get_mut(handle)
            .ok_or(HleError::InvalidArgument("stale texture handle"))?;

        let alias_key = AliasKey {
            format,
            width: entry.shape.width,
            height: entry.shape.height,
            image_type: target.image_type(),
        };
        let view_key = ImageViewKey {
            view_type: target.view_type(),
            format: info.vk_format,
            components: [swizzle.r, swizzle.g, swizzle.b, swizzle.a],
            aspect,
            base_level,
            level_count,
            base_layer,
            layer_count,
        };

        entry.image_view(context, &alias_key, &view_key)
    }

    /// Resolve a guest texel-buffer request into a host buffer view.
    pub(crate) fn buffer_view(
        &mut self,
        context: &GpuContext,
        handle: TextureHandle,
        format: Format,
        size: u64,
    ) -> Result<vk::BufferView> {
        let entry = self
            .textures
            .get_mut(handle)
            .ok_or(HleError::InvalidArgument("stale texture handle"))?;

        let key = BufferViewKey {
            format: format.info().vk_format,
            offset: 0,
            size,
        };
        entry.buffer_view(context, &key)
    }

    /// Destroy every remaining entry; used at device teardown.
    pub(crate) fn destroy_all(&mut self, context: &GpuContext) {
        for mut texture in self.textures.drain() {
            texture.destroy(context);
        }
        self.by_address.clear();
    }
}

fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shape(format: Format) -> TextureShape {
        TextureShape {
            flags: TextureFlags::empty(),
            target: TextureTarget::D2,
            width: 64,
            height: 64,
            depth: 1,
            levels: 1,
            format,
            samples: 1,
            stride: 0,
        }
    }

    fn test_texture(address: u64, shape: TextureShape) -> VirtualTexture {
        VirtualTexture {
            address,
            shape,
            storage_size: 0x4000,
            storage_class: StorageClass::BlockLinear,
            tile_height: 8,
            tile_depth: 1,
            refs: 1,
            format_list: vec![shape.format.info().vk_format],
            memory_buffer: vk::Buffer::null(),
            pool_memory: vk::DeviceMemory::null(),
            pool_offset: 0,
            image_memory: None,
            images: Vec::new(),
            buffer_views: HashMap::new(),
        }
    }

    #[test]
    fn compatible_shapes_share_one_entry() {
        let mut manager = VirtualTextureManager::new();
        let shape = test_shape(Format::Rgba8);

        let handle = manager.insert(0x1000, test_texture(0x1000, shape));
        let found = manager.find_compatible(0x1000, &shape).unwrap();
        assert_eq!(found, handle);

        manager.acquire(found);
        assert_eq!(manager.textures.get(handle).unwrap().refs, 2);
    }

    #[test]
    fn same_address_different_shape_is_a_miss() {
        let mut manager = VirtualTextureManager::new();
        let rgba = test_shape(Format::Rgba8);
        let bgra = test_shape(Format::Bgra8);

        manager.insert(0x1000, test_texture(0x1000, rgba));
        assert!(manager.find_compatible(0x1000, &bgra).is_none());
        assert!(manager.find_compatible(0x2000, &rgba).is_none());

        // Both shapes can be live in the same bucket at once
        let other = manager.insert(0x1000, test_texture(0x1000, bgra));
        assert_eq!(manager.find_compatible(0x1000, &bgra), Some(other));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn create_put_round_trip_empties_the_bucket() {
        let mut manager = VirtualTextureManager::new();
        let shape = test_shape(Format::Rgba8);

        let handle = manager.insert(0x1000, test_texture(0x1000, shape));
        manager.acquire(handle);

        // First put only drops the refcount
        assert!(manager.release(handle).is_none());
        assert_eq!(manager.len(), 1);

        // Second put erases the node
        let removed = manager.release(handle).unwrap();
        assert_eq!(removed.address, 0x1000);
        assert!(manager.is_empty());
        assert!(manager.by_address.is_empty());

        // The old handle no longer resolves
        assert!(manager.find_compatible(0x1000, &shape).is_none());
        assert!(manager.release(handle).is_none());
    }

    #[test]
    fn entries_survive_unrelated_removal() {
        let mut manager = VirtualTextureManager::new();
        let rgba = test_shape(Format::Rgba8);
        let bgra = test_shape(Format::Bgra8);

        let a = manager.insert(0x1000, test_texture(0x1000, rgba));
        let b = manager.insert(0x1000, test_texture(0x1000, bgra));

        manager.release(a);
        assert_eq!(manager.find_compatible(0x1000, &bgra), Some(b));
        assert_eq!(manager.len(), 1);
    }
}
