//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Qualcomm,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x5143 => Self::Qualcomm,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
///
/// Queried once at device creation; the shim refuses devices that cannot
/// express the guest API's synchronization and memory model.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Timeline semaphore support (VK 1.2 core)
    pub supports_timeline_semaphore: bool,
    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Buffer device address support (used for guest GPU addresses)
    pub supports_buffer_device_address: bool,
    /// Host memory import support (`VK_EXT_external_memory_host`)
    pub supports_host_memory_import: bool,
    /// Required alignment for imported host pointers, in bytes
    pub min_imported_host_pointer_alignment: u64,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Device memory properties, kept for memory-type selection
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    /// Available device extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut host_import_properties = vk::PhysicalDeviceExternalMemoryHostPropertiesEXT::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut host_import_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 3;

        let supports_host_memory_import =
            available_extensions.contains("VK_EXT_external_memory_host");

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_timeline_semaphore: has_vulkan_1_3,
            supports_synchronization2: has_vulkan_1_3,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_host_memory_import,
            min_imported_host_pointer_alignment: host_import_properties
                .min_imported_host_pointer_alignment,

            device_local_memory_mb,
            memory_properties,

            available_extensions,
        }
    }

    /// Check if the GPU can express the guest API's execution model.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        // Guest GPU addresses are host buffer device addresses
        if !self.supports_buffer_device_address {
            return false;
        }

        // Guest memory pools are zero-copy imports of CPU spans
        if !self.supports_host_memory_import {
            return false;
        }

        true
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Qualcomm);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
