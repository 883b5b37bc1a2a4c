//! Guest-facing graphics object surface for the Prism graphics shim.
//!
//! This crate re-targets calls against a console-native, queue-based
//! graphics API onto Vulkan while preserving the guest API's asynchronous
//! execution and explicit-synchronization contract:
//! - `Device` owns the host context, scheduler, and virtual-texture cache
//! - `MemoryPool` imports guest CPU spans as host GPU memory
//! - `Texture` handles share de-duplicated host resources by GPU address
//! - `Queue` sequences guest submissions onto one shared host timeline
//! - `Sync` is the guest-visible fence over that timeline
//! - `Window` brokers the presentable-texture acquire/present handshake

pub mod arena;
pub mod device;
pub mod error;
pub mod format;
pub mod memory_pool;
pub mod queue;
pub mod sampler;
pub mod sync;
pub mod texture;
pub mod virtual_texture;
pub mod window;

pub use device::{Device, DeviceBuilder, DeviceFlags, DepthMode, WindowOriginMode};
pub use error::{HleError, Result};
pub use format::{Format, FormatClass, FormatInfo};
pub use memory_pool::{MemoryPool, MemoryPoolBuilder, MemoryPoolFlags};
pub use queue::{Queue, QueueBuilder, QueueErrorStatus, QueueFlags};
pub use sampler::{
    CompareFunc, CompareMode, MagFilter, MinFilter, Sampler, SamplerBuilder, WrapMode,
};
pub use sync::{Sync, SyncCondition, SyncFlags, SyncWaitResult};
pub use texture::{
    StorageClass, Texture, TextureBuilder, TextureDepthStencilMode, TextureFlags, TextureSwizzle,
    TextureSwizzleMapping, TextureTarget, TextureView,
};
pub use virtual_texture::{TextureHandle, VirtualTextureManager};
pub use window::{Window, WindowBuilder};
