//! GPU memory management.
//!
//! Three kinds of memory flow through the shim:
//! - Imported buffers: guest memory pools are CPU spans imported zero-copy
//!   as host-GPU buffer memory (`VK_EXT_external_memory_host`).
//! - Aliasing buffers: format-agnostic buffer windows bound at an explicit
//!   offset into already-imported memory.
//! - Image memory: dedicated device-local allocations for tiled images,
//!   managed via gpu-allocator, that several alias images may bind to.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use prism_core::util::is_aligned;
use std::sync::Arc;

/// `VK_EXT_external_memory_host` is missing a safe wrapper in the `ash`
/// version this crate depends on; this trait supplies the one call we need,
/// following the same pattern `ash` uses for its other extension wrappers.
trait ExternalMemoryHostDeviceExt {
    unsafe fn get_memory_host_pointer_properties(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        host_pointer: *const std::ffi::c_void,
        memory_host_pointer_properties: &mut vk::MemoryHostPointerPropertiesEXT<'_>,
    ) -> VkResult<()>;
}

impl ExternalMemoryHostDeviceExt for ash::ext::external_memory_host::Device {
    #[inline]
    unsafe fn get_memory_host_pointer_properties(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        host_pointer: *const std::ffi::c_void,
        memory_host_pointer_properties: &mut vk::MemoryHostPointerPropertiesEXT<'_>,
    ) -> VkResult<()> {
        (self.fp().get_memory_host_pointer_properties_ext)(
            self.device(),
            handle_type,
            host_pointer,
            memory_host_pointer_properties,
        )
        .result()
    }
}

/// The usage flags shared by every buffer the shim creates.
///
/// Guest buffers carry no usage information, so imported and aliasing
/// buffers must be usable as anything the guest may bind them as.
pub fn all_buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
        | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDIRECT_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
}

/// A host buffer backed zero-copy by an imported CPU span.
pub struct ImportedBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    host_ptr: *mut u8,
    size: u64,
}

// The CPU span is owned by the guest for the pool's whole lifetime; the
// import only hands it to the GPU.
unsafe impl Send for ImportedBuffer {}
unsafe impl Sync for ImportedBuffer {}

impl ImportedBuffer {
    /// Pointer to the imported CPU span.
    pub fn host_ptr(&self) -> *mut u8 {
        self.host_ptr
    }

    /// Size of the imported span in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Destroy the buffer and free the imported memory binding.
    ///
    /// # Safety
    /// The device must be valid and the buffer must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Import a CPU span as host-GPU buffer memory.
///
/// The span and its length must satisfy the device's imported-pointer
/// alignment; import failure is unrecoverable for the pool being built.
pub fn import_host_buffer(
    context: &GpuContext,
    host_ptr: *mut u8,
    size: u64,
) -> Result<ImportedBuffer> {
    let capabilities = context.capabilities();
    if !capabilities.supports_host_memory_import {
        return Err(GpuError::ImportUnsupported(
            "VK_EXT_external_memory_host is unavailable".to_string(),
        ));
    }

    let alignment = capabilities.min_imported_host_pointer_alignment;
    if alignment != 0 && (!is_aligned(host_ptr as u64, alignment) || !is_aligned(size, alignment))
    {
        return Err(GpuError::ImportUnsupported(format!(
            "span {host_ptr:p}+{size:#x} is not aligned to {alignment:#x}"
        )));
    }

    let device = context.device();
    let handle_type = vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT;

    let mut pointer_properties = vk::MemoryHostPointerPropertiesEXT::default();
    unsafe {
        context.external_memory_host.get_memory_host_pointer_properties(
            handle_type,
            host_ptr.cast(),
            &mut pointer_properties,
        )?;
    }

    let memory_type_index = find_host_memory_type(
        &capabilities.memory_properties,
        pointer_properties.memory_type_bits,
    )?;

    let mut external_info =
        vk::ExternalMemoryBufferCreateInfo::default().handle_types(handle_type);
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(all_buffer_usage())
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .push_next(&mut external_info);

    let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

    let mut import_info = vk::ImportMemoryHostPointerInfoEXT::default()
        .handle_type(handle_type)
        .host_pointer(host_ptr.cast());
    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(size)
        .memory_type_index(memory_type_index)
        .push_next(&mut import_info)
        .push_next(&mut flags_info);

    let memory = match unsafe { device.allocate_memory(&allocate_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }
    };

    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory, None);
        }
        return Err(e.into());
    }

    Ok(ImportedBuffer {
        buffer,
        memory,
        host_ptr,
        size,
    })
}

/// Create a buffer aliasing `memory` at `offset`.
///
/// Used to view a window of an imported pool's memory as a buffer of its
/// own, e.g. the backing store of one texture within a pool.
pub fn create_aliasing_buffer(
    context: &GpuContext,
    memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
) -> Result<vk::Buffer> {
    let device = context.device();

    let mut external_info = vk::ExternalMemoryBufferCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT);
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(all_buffer_usage())
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .push_next(&mut external_info);

    let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, offset) } {
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(e.into());
    }

    Ok(buffer)
}

/// Get the device address of a buffer.
pub fn buffer_device_address(context: &GpuContext, buffer: vk::Buffer) -> vk::DeviceAddress {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { context.device().get_buffer_device_address(&info) }
}

/// Select a host-visible memory type from the allowed bits.
fn find_host_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    allowed_bits: u32,
) -> Result<u32> {
    let types = &memory_properties.memory_types[..memory_properties.memory_type_count as usize];

    let preferred =
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    let allowed = |i: usize| allowed_bits & (1 << i) != 0;

    (0..types.len())
        .find(|&i| allowed(i) && types[i].property_flags.contains(preferred))
        .or_else(|| (0..types.len()).find(|&i| allowed(i)))
        .map(|i| i as u32)
        .ok_or_else(|| {
            GpuError::ImportUnsupported("no memory type accepts host pointers".to_string())
        })
}

/// GPU memory allocator wrapper for device-local image memory.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Allocate device-local memory sized for an image of the given shape.
    ///
    /// A probe image is created to read the memory requirements and
    /// destroyed again; the allocation outlives it so that any number of
    /// alias images of compatible shape can bind to it.
    pub fn allocate_image_memory(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        name: &str,
    ) -> Result<ImageMemory> {
        let probe = unsafe {
            self.device
                .create_image(create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(probe) };
        unsafe { self.device.destroy_image(probe, None) };

        let allocation = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(ImageMemory {
            size: requirements.size,
            allocation: Some(allocation),
        })
    }

    /// Free an image memory allocation.
    pub fn free_image_memory(&mut self, memory: &mut ImageMemory) -> Result<()> {
        if let Some(allocation) = memory.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A device-local allocation that alias images bind to.
pub struct ImageMemory {
    allocation: Option<Allocation>,
    size: u64,
}

impl ImageMemory {
    /// Size of the allocation in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bind an image to this allocation.
    ///
    /// # Safety
    /// The device and image must be valid and the image's requirements must
    /// be compatible with the allocation.
    pub unsafe fn bind_image(&self, device: &ash::Device, image: vk::Image) -> Result<()> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Image memory already freed".to_string()))?;

        device.bind_image_memory(image, allocation.memory(), allocation.offset())?;
        Ok(())
    }
}
