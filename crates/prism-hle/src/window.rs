//! Presentable-surface windows.
//!
//! A window rotates a fixed set of presentable textures and brokers the
//! handshake between "texture available" (a binary semaphore signaled by
//! the native acquire) and "texture consumed" (a guest wait on a `Sync`
//! fenced by the acquire operation).

use crate::device::Device;
use crate::error::{HleError, Result};
use crate::sync::Sync;
use crate::texture::Texture;
use crate::virtual_texture::TextureHandle;
use ash::vk;
use prism_gpu::{BinarySemaphore, Operation, SyncOperation};
use std::sync::Arc;

/// Builder for creating a guest window.
#[derive(Default)]
pub struct WindowBuilder {
    device: Option<Arc<Device>>,
    native_window: u64,
    textures: Vec<TextureHandle>,
    present_interval: i32,
    num_active_textures: i32,
}

impl WindowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device(&mut self, device: Arc<Device>) {
        self.device = Some(device);
    }

    /// Record the opaque handle of the native surface to present into.
    pub fn set_native_window(&mut self, native_window: u64) {
        self.native_window = native_window;
    }

    /// Set the rotation of presentable textures.
    pub fn set_textures(&mut self, textures: &[&Texture]) {
        self.textures = textures.iter().map(|texture| texture.handle()).collect();
        self.num_active_textures = textures.len() as i32;
    }

    pub fn set_present_interval(&mut self, present_interval: i32) {
        self.present_interval = present_interval;
    }

    pub fn set_num_active_textures(&mut self, num_active_textures: i32) {
        self.num_active_textures = num_active_textures;
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn native_window(&self) -> u64 {
        self.native_window
    }

    pub fn num_textures(&self) -> i32 {
        self.textures.len() as i32
    }

    pub fn num_active_textures(&self) -> i32 {
        self.num_active_textures
    }

    pub fn present_interval(&self) -> i32 {
        self.present_interval
    }
}

/// A guest window.
pub struct Window {
    device: Arc<Device>,
    native_window: u64,
    present_interval: i32,
    textures: Vec<TextureHandle>,
    next_texture_index: i32,
    num_active_textures: i32,
    /// The present hand-off consumed by the native present path: the
    /// semaphore the queue's present operation signals, and the texture it
    /// presents.
    pending_present: Option<(Arc<BinarySemaphore>, i32)>,
    debug_label: Option<String>,
}

impl Window {
    pub fn new(builder: &WindowBuilder) -> Result<Self> {
        let device = builder
            .device
            .clone()
            .ok_or(HleError::InvalidArgument("window has no device"))?;
        if builder.textures.is_empty() {
            return Err(HleError::InvalidArgument("window has no textures"));
        }

        Ok(Self {
            device,
            native_window: builder.native_window,
            present_interval: builder.present_interval,
            textures: builder.textures.clone(),
            next_texture_index: 0,
            num_active_textures: builder.num_active_textures,
            pending_present: None,
            debug_label: None,
        })
    }

    pub fn set_debug_label(&mut self, label: impl Into<String>) {
        self.debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    /// Hand out the next texture in rotation.
    ///
    /// `sync` is fenced with a fresh timeline value that becomes
    /// satisfiable once the native acquire has signaled and the scheduler
    /// has submitted the bridging operation: native acquire signals the
    /// binary semaphore, the queued operation waits on it and signals the
    /// timeline, and the guest's wait on `sync` completes.
    pub fn acquire_texture(&mut self, sync: &mut Sync) -> Result<i32> {
        let index = self.next_texture_index;
        self.next_texture_index = next_index(self.next_texture_index, self.textures.len());

        let device = Arc::clone(&self.device);
        let scheduler = device.scheduler();
        let semaphore = scheduler.create_binary_semaphore()?;

        // The native acquire of `native_window` is recorded here; its
        // signal arms the semaphore. Marking it submitted unblocks the
        // worker's wait for exactly that recording.
        tracing::debug!(window = self.native_window, index, "native acquire requested");
        semaphore.mark_submitted();

        scheduler.gen_and_queue_operation(|| {
            let value = scheduler.incr_timeline();
            sync.fence(value);
            Operation::Sync(SyncOperation {
                signal_timeline_value: value,
                wait_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                wait_binary: Some(semaphore),
                ..SyncOperation::default()
            })
        });

        Ok(index)
    }

    /// Receive the present hand-off from the queue.
    ///
    /// The native present must wait for `semaphore`'s submission before it
    /// may queue, then consume it; this shim stops at recording the
    /// hand-off.
    pub(crate) fn present_texture(&mut self, semaphore: Arc<BinarySemaphore>, texture_index: i32) {
        tracing::debug!(
            window = self.native_window,
            texture_index,
            "native present requested"
        );
        self.pending_present = Some((semaphore, texture_index));
    }

    /// Take the recorded present hand-off.
    ///
    /// Consumed by the native present path: wait for the semaphore's
    /// submission, then queue the native present of the texture.
    pub fn take_pending_present(&mut self) -> Option<(Arc<BinarySemaphore>, i32)> {
        self.pending_present.take()
    }

    pub fn native_window(&self) -> u64 {
        self.native_window
    }

    pub fn present_interval(&self) -> i32 {
        self.present_interval
    }

    pub fn set_present_interval(&mut self, present_interval: i32) {
        self.present_interval = present_interval;
    }

    pub fn set_crop(&mut self, _x: i32, _y: i32, _w: i32, _h: i32) -> Result<()> {
        Err(HleError::Unsupported("Window::set_crop"))
    }

    pub fn crop(&self) -> Result<(i32, i32, i32, i32)> {
        Err(HleError::Unsupported("Window::crop"))
    }

    pub fn set_num_active_textures(&mut self, num_active_textures: i32) {
        self.num_active_textures = num_active_textures;
    }

    pub fn num_active_textures(&self) -> i32 {
        self.num_active_textures
    }

    pub fn num_textures(&self) -> i32 {
        self.textures.len() as i32
    }

    /// The texture handle at `index` in the rotation.
    pub fn texture(&self, index: i32) -> Result<TextureHandle> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.textures.get(i))
            .copied()
            .ok_or(HleError::InvalidArgument("texture index out of range"))
    }
}

/// Advance a round-robin rotation index.
fn next_index(current: i32, len: usize) -> i32 {
    (current + 1) % len as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_wraps_around() {
        assert_eq!(next_index(0, 3), 1);
        assert_eq!(next_index(1, 3), 2);
        assert_eq!(next_index(2, 3), 0);
        assert_eq!(next_index(0, 1), 0);
    }

    #[test]
    fn builder_defaults_are_empty() {
        let mut builder = WindowBuilder::new();
        builder.set_native_window(0xDEAD);
        assert_eq!(builder.num_textures(), 0);
        assert_eq!(builder.num_active_textures(), 0);
        assert_eq!(builder.native_window(), 0xDEAD);
    }
}
