//! Vulkan host abstraction for the Prism graphics shim.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection for the shim's requirements
//! - Host memory import, memory aliasing, and image memory allocation
//! - The command scheduler serializing all submissions onto one host queue

pub mod capabilities;
pub mod context;
pub mod error;
pub mod instance;
pub mod memory;
pub mod scheduler;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{
    all_buffer_usage, buffer_device_address, create_aliasing_buffer, import_host_buffer,
    GpuAllocator, ImageMemory, ImportedBuffer,
};
pub use scheduler::{BinarySemaphore, CommandScheduler, Operation, SyncOperation, WaitResult};
