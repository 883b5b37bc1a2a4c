//! Guest memory pools.
//!
//! A memory pool is a guest-defined span of CPU memory imported zero-copy
//! as host GPU buffer memory, or a purely virtual pool used only as an
//! addressing namespace. Textures and buffers referencing a pool must not
//! outlive it; that is a guest contract this layer does not enforce.

use crate::device::Device;
use crate::error::{HleError, Result};
use bitflags::bitflags;
use prism_gpu::{buffer_device_address, import_host_buffer, ImportedBuffer};
use std::sync::Arc;

bitflags! {
    /// Guest memory pool flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryPoolFlags: u32 {
        const CPU_NO_ACCESS = 1 << 0;
        const CPU_UNCACHED = 1 << 1;
        const GPU_NO_ACCESS = 1 << 2;
        const GPU_UNCACHED = 1 << 3;
        const GPU_CACHED = 1 << 4;
        const SHADER_CODE = 1 << 5;
        const COMPRESSIBLE = 1 << 6;
        const PHYSICAL = 1 << 7;
        const VIRTUAL = 1 << 8;
    }
}

/// Builder for creating a guest memory pool.
#[derive(Default)]
pub struct MemoryPoolBuilder {
    device: Option<Arc<Device>>,
    storage: Option<(*mut u8, u64)>,
    flags: MemoryPoolFlags,
}

impl MemoryPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device(&mut self, device: Arc<Device>) {
        self.device = Some(device);
    }

    /// Set the CPU span backing the pool.
    pub fn set_storage(&mut self, memory: *mut u8, size: u64) {
        self.storage = Some((memory, size));
    }

    pub fn set_flags(&mut self, flags: MemoryPoolFlags) {
        self.flags = flags;
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn memory(&self) -> *mut u8 {
        self.storage.map_or(std::ptr::null_mut(), |(ptr, _)| ptr)
    }

    pub fn size(&self) -> u64 {
        self.storage.map_or(0, |(_, size)| size)
    }

    pub fn flags(&self) -> MemoryPoolFlags {
        self.flags
    }
}

/// A guest memory pool.
pub struct MemoryPool {
    device: Arc<Device>,
    flags: MemoryPoolFlags,
    /// `None` for purely virtual pools.
    buffer: Option<ImportedBuffer>,
    debug_label: Option<String>,
}

impl MemoryPool {
    /// Import the builder's storage and create the pool.
    pub fn new(builder: &MemoryPoolBuilder) -> Result<Self> {
        let device = builder
            .device
            .clone()
            .ok_or(HleError::InvalidArgument("memory pool has no device"))?;

        let buffer = if builder.flags.contains(MemoryPoolFlags::VIRTUAL) {
            None
        } else {
            let (ptr, size) = builder
                .storage
                .ok_or(HleError::InvalidArgument("memory pool has no storage"))?;
            Some(import_host_buffer(device.context(), ptr, size)?)
        };

        Ok(Self {
            device,
            flags: builder.flags,
            buffer,
            debug_label: None,
        })
    }

    pub fn set_debug_label(&mut self, label: impl Into<String>) {
        self.debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    /// Pointer to the pool's CPU mapping; null for virtual pools.
    pub fn map(&self) -> *mut u8 {
        self.buffer
            .as_ref()
            .map_or(std::ptr::null_mut(), ImportedBuffer::host_ptr)
    }

    /// Flush a CPU-written range towards the GPU.
    ///
    /// The import is host-coherent, so this is a no-op.
    pub fn flush_mapped_range(&self, _offset: i64, _size: u64) {}

    /// Invalidate a GPU-written range for CPU reads.
    ///
    /// The import is host-coherent, so this is a no-op.
    pub fn invalidate_mapped_range(&self, _offset: i64, _size: u64) {}

    /// The pool's GPU address.
    pub fn buffer_address(&self) -> Result<u64> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or(HleError::Unsupported("virtual pools have no GPU address"))?;
        Ok(buffer_device_address(self.device.context(), buffer.buffer))
    }

    /// Map further virtual-pool pages; not supported by this shim.
    pub fn map_virtual(&mut self, _requests: &[VirtualMappingRequest]) -> Result<()> {
        Err(HleError::Unsupported("MemoryPool::map_virtual"))
    }

    pub fn size(&self) -> u64 {
        self.buffer.as_ref().map_or(0, ImportedBuffer::size)
    }

    pub fn flags(&self) -> MemoryPoolFlags {
        self.flags
    }

    pub(crate) fn imported(&self) -> Option<&ImportedBuffer> {
        self.buffer.as_ref()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            unsafe {
                buffer.destroy(self.device.context().device());
            }
        }
    }
}

/// A request to map physical-pool pages into a virtual pool.
#[derive(Debug, Clone, Copy)]
pub struct VirtualMappingRequest {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_records_storage_and_flags() {
        let mut builder = MemoryPoolBuilder::new();
        assert!(builder.memory().is_null());
        assert_eq!(builder.size(), 0);

        let mut span = [0u8; 16];
        builder.set_storage(span.as_mut_ptr(), span.len() as u64);
        builder.set_flags(MemoryPoolFlags::GPU_CACHED | MemoryPoolFlags::CPU_UNCACHED);

        assert_eq!(builder.memory(), span.as_mut_ptr());
        assert_eq!(builder.size(), 16);
        assert!(builder.flags().contains(MemoryPoolFlags::GPU_CACHED));
    }
}
