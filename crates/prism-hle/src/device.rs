//! The guest device: root of the object surface.
//!
//! Every other guest object is built against a device and holds it alive
//! through an `Arc`. The device owns the host context, the command
//! scheduler, and the virtual-texture cache.

use crate::error::Result;
use crate::virtual_texture::VirtualTextureManager;
use bitflags::bitflags;
use parking_lot::Mutex;
use prism_gpu::{CommandScheduler, GpuContext, GpuContextBuilder};
use std::sync::Arc;

bitflags! {
    /// Guest device creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        const DEBUG_ENABLE_LEVEL2 = 1 << 0;
        const DEBUG_SKIP_CALLS_ON_ERROR = 1 << 1;
        const DEBUG_ENABLE_LEVEL3 = 1 << 2;
        const DEFERRED_FINALIZE = 1 << 3;
        const DEBUG_ENABLE_LEVEL4 = 1 << 4;
        const DEBUG_ENABLE_LEVEL0 = 1 << 5;
        const DEBUG_ENABLE_LEVEL1 = 1 << 6;
        const DEFERRED_FIRMWARE_MEMORY_RECLAIM = 1 << 7;
        const SEPARATE_SAMPLER_TEXTURE_SUPPORT = 1 << 8;
    }
}

impl DeviceFlags {
    /// Whether any guest debug level is enabled.
    pub fn debug_enabled(self) -> bool {
        self.intersects(
            Self::DEBUG_ENABLE_LEVEL0
                | Self::DEBUG_ENABLE_LEVEL1
                | Self::DEBUG_ENABLE_LEVEL2
                | Self::DEBUG_ENABLE_LEVEL3
                | Self::DEBUG_ENABLE_LEVEL4,
        )
    }
}

/// Where window-space coordinates originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowOriginMode {
    #[default]
    LowerLeft,
    UpperLeft,
}

/// The clip-space depth convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthMode {
    #[default]
    NearIsMinusW,
    NearIsZero,
}

/// Builder for creating a guest device.
#[derive(Debug, Default)]
pub struct DeviceBuilder {
    flags: DeviceFlags,
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flags(&mut self, flags: DeviceFlags) {
        self.flags = flags;
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }
}

/// Mutable device state settable after creation.
#[derive(Debug, Default)]
struct DeviceState {
    window_origin_mode: WindowOriginMode,
    depth_mode: DepthMode,
    debug_label: Option<String>,
}

/// The guest device.
pub struct Device {
    context: Arc<GpuContext>,
    scheduler: CommandScheduler,
    textures: Mutex<VirtualTextureManager>,
    flags: DeviceFlags,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Create a device, bringing up the host context and scheduler.
    pub fn new(builder: &DeviceBuilder) -> Result<Arc<Self>> {
        let context = Arc::new(
            GpuContextBuilder::new()
                .validation(builder.flags.debug_enabled())
                .build()?,
        );

        let scheduler = CommandScheduler::new(Arc::clone(&context))?;

        Ok(Arc::new(Self {
            context,
            scheduler,
            textures: Mutex::new(VirtualTextureManager::new()),
            flags: builder.flags,
            state: Mutex::new(DeviceState::default()),
        }))
    }

    /// The host context.
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    /// The command scheduler.
    pub fn scheduler(&self) -> &CommandScheduler {
        &self.scheduler
    }

    /// The virtual-texture cache.
    ///
    /// Guest resource construction and destruction may run on any thread;
    /// the mutex makes the cache safe under that.
    pub(crate) fn virtual_textures(&self) -> &Mutex<VirtualTextureManager> {
        &self.textures
    }

    /// Device creation flags.
    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn set_window_origin_mode(&self, mode: WindowOriginMode) {
        self.state.lock().window_origin_mode = mode;
    }

    pub fn window_origin_mode(&self) -> WindowOriginMode {
        self.state.lock().window_origin_mode
    }

    pub fn set_depth_mode(&self, mode: DepthMode) {
        self.state.lock().depth_mode = mode;
    }

    pub fn depth_mode(&self) -> DepthMode {
        self.state.lock().depth_mode
    }

    pub fn set_debug_label(&self, label: impl Into<String>) {
        self.state.lock().debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<String> {
        self.state.lock().debug_label.clone()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Any cache entries still alive at teardown lost their textures
        // without a put; release their host objects while the context is
        // still usable.
        self.textures.lock().destroy_all(&self.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_levels_enable_validation() {
        assert!(!DeviceFlags::DEFERRED_FINALIZE.debug_enabled());
        assert!(DeviceFlags::DEBUG_ENABLE_LEVEL0.debug_enabled());
        assert!(
            (DeviceFlags::DEBUG_ENABLE_LEVEL4 | DeviceFlags::DEFERRED_FINALIZE).debug_enabled()
        );
    }
}
