//! Guest queues.
//!
//! Every guest queue is multiplexed onto the one host queue. In-order
//! execution per guest queue is encoded by `max_queue_timeline_value`: the
//! timeline value all of this queue's new operations wait on. Fences signal
//! past it, external waits raise it, and acquired window textures adopt it,
//! so program order holds without a dedicated host queue per guest queue.

use crate::device::Device;
use crate::error::{HleError, Result};
use crate::sync::{Sync, SyncCondition, SyncFlags};
use crate::window::Window;
use bitflags::bitflags;
use prism_gpu::{Operation, SyncOperation};
use std::sync::Arc;

/// Granularity of guest queue control memory.
pub const QUEUE_PAGE_SIZE: u64 = 0x1000;

bitflags! {
    /// Guest queue creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFlags: u32 {
        const NO_FRAGMENT_INTERLOCK = 1 << 0;
        const NO_ZCULL = 1 << 1;
    }
}

/// Builder for creating a guest queue.
#[derive(Default)]
pub struct QueueBuilder {
    device: Option<Arc<Device>>,
    flags: QueueFlags,
    command_memory_size: u64,
    compute_memory_size: u64,
    control_memory_size: u64,
    queue_memory: Option<(*mut u8, u64)>,
    command_flush_threshold: Option<u64>,
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device(&mut self, device: Arc<Device>) {
        self.device = Some(device);
    }

    pub fn set_flags(&mut self, flags: QueueFlags) {
        self.flags = flags;
    }

    pub fn set_command_memory_size(&mut self, size: u64) {
        self.command_memory_size = size;
    }

    pub fn set_compute_memory_size(&mut self, size: u64) {
        self.compute_memory_size = size;
    }

    pub fn set_control_memory_size(&mut self, size: u64) {
        self.control_memory_size = size;
    }

    /// Bytes of guest memory the queue requires for its own bookkeeping.
    pub fn queue_memory_size(&self) -> u64 {
        QUEUE_PAGE_SIZE
    }

    pub fn set_queue_memory(&mut self, memory: *mut u8, size: u64) {
        self.queue_memory = Some((memory, size));
    }

    pub fn set_command_flush_threshold(&mut self, threshold: u64) {
        self.command_flush_threshold = Some(threshold);
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn command_memory_size(&self) -> u64 {
        self.command_memory_size
    }

    pub fn compute_memory_size(&self) -> u64 {
        self.compute_memory_size
    }

    pub fn control_memory_size(&self) -> u64 {
        self.control_memory_size
    }

    pub fn command_flush_threshold(&self) -> u64 {
        self.command_flush_threshold.unwrap_or(256)
    }

    pub fn queue_memory(&self) -> *mut u8 {
        self.queue_memory
            .map_or(std::ptr::null_mut(), |(ptr, _)| ptr)
    }
}

/// GPU error classes a guest may query from a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueErrorStatus {
    NoError,
    Unknown,
    MmuFault,
    PushbufferDmaException,
    EngineException,
    Timeout,
}

/// A guest queue.
pub struct Queue {
    device: Arc<Device>,
    flags: QueueFlags,
    /// The timeline value all new operations on this queue wait on.
    max_queue_timeline_value: u64,
    /// Fenced by window acquires issued through this queue.
    texture_available_sync: Sync,
    debug_label: Option<String>,
}

impl Queue {
    pub fn new(builder: &QueueBuilder) -> Result<Self> {
        let device = builder
            .device
            .clone()
            .ok_or(HleError::InvalidArgument("queue has no device"))?;
        let texture_available_sync = Sync::new(Arc::clone(&device));

        Ok(Self {
            device,
            flags: builder.flags,
            max_queue_timeline_value: 0,
            texture_available_sync,
            debug_label: None,
        })
    }

    pub fn set_debug_label(&mut self, label: impl Into<String>) {
        self.debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    /// Fence `sync` behind everything queued on this queue so far.
    ///
    /// Reserves a fresh timeline value, records it on `sync`, and queues an
    /// operation that waits for the queue's prior work (at the stages
    /// `condition` selects) before signaling that value.
    pub fn fence_sync(&mut self, sync: &mut Sync, condition: SyncCondition, flags: SyncFlags) {
        let device = Arc::clone(&self.device);
        let scheduler = device.scheduler();
        let queue_max = self.max_queue_timeline_value;

        scheduler.gen_and_queue_operation(|| {
            let value = scheduler.incr_timeline();
            sync.fence(value);
            Operation::Sync(SyncOperation {
                wait_timeline_value: queue_max,
                signal_timeline_value: value,
                wait_stage_mask: condition.wait_stage_mask(),
                ..SyncOperation::default()
            })
        });

        if flags.contains(SyncFlags::FLUSH_FOR_CPU) {
            self.flush();
        }
    }

    /// Order all subsequent operations on this queue after `sync`.
    ///
    /// Returns `false` without queuing anything when the dependency is
    /// already satisfied by program order: the sync was never fenced, or
    /// this queue's ordering value already covers it.
    pub fn wait_sync(&mut self, sync: &Sync) -> bool {
        if !sync.waiting() || !needs_barrier(self.max_queue_timeline_value, sync.timeline_value())
        {
            return false;
        }

        let device = Arc::clone(&self.device);
        let scheduler = device.scheduler();
        let wait_value = sync.timeline_value();
        let queue_max = &mut self.max_queue_timeline_value;

        scheduler.gen_and_queue_operation(|| {
            let value = scheduler.incr_timeline();
            *queue_max = value;
            Operation::Sync(SyncOperation {
                wait_timeline_value: wait_value,
                signal_timeline_value: value,
                ..SyncOperation::default()
            })
        });

        true
    }

    /// Present a window texture, ordered after this queue's prior work.
    ///
    /// The native present cannot consume a timeline semaphore, so the
    /// queued operation signals a fresh binary semaphore which is handed to
    /// the window together with the texture index.
    pub fn present_texture(&mut self, window: &mut Window, texture_index: i32) -> Result<()> {
        let device = Arc::clone(&self.device);
        let scheduler = device.scheduler();
        let semaphore = scheduler.create_binary_semaphore()?;
        let queue_max = self.max_queue_timeline_value;

        let operation_semaphore = Arc::clone(&semaphore);
        scheduler.gen_and_queue_operation(|| {
            Operation::Sync(SyncOperation {
                wait_timeline_value: queue_max,
                signal_timeline_value: scheduler.incr_timeline(),
                signal_binary: Some(operation_semaphore),
                ..SyncOperation::default()
            })
        });

        window.present_texture(semaphore, texture_index);
        Ok(())
    }

    /// Acquire the next window texture and order this queue after it.
    ///
    /// All subsequent operations on the queue implicitly wait for the
    /// acquired texture to become available.
    pub fn acquire_texture(&mut self, window: &mut Window) -> Result<i32> {
        let index = window.acquire_texture(&mut self.texture_available_sync)?;
        self.max_queue_timeline_value = self.texture_available_sync.timeline_value();
        Ok(index)
    }

    /// Push queued work towards the device.
    pub fn flush(&self) {
        self.device.scheduler().flush();
    }

    /// Block until all work queued so far has completed.
    pub fn finish(&mut self) -> Result<()> {
        Err(HleError::Unsupported("Queue::finish"))
    }

    /// Submit recorded guest command handles.
    pub fn submit_commands(&mut self, _handles: &[u64]) -> Result<()> {
        Err(HleError::Unsupported("Queue::submit_commands"))
    }

    /// The queue's sticky GPU error state.
    pub fn error_status(&self) -> Result<QueueErrorStatus> {
        Err(HleError::Unsupported("Queue::error_status"))
    }

    pub fn total_command_memory_used(&self) -> Result<u64> {
        Err(HleError::Unsupported("Queue::total_command_memory_used"))
    }

    pub fn total_control_memory_used(&self) -> Result<u64> {
        Err(HleError::Unsupported("Queue::total_control_memory_used"))
    }

    pub fn total_compute_memory_used(&self) -> Result<u64> {
        Err(HleError::Unsupported("Queue::total_compute_memory_used"))
    }

    pub fn reset_memory_usage_counts(&mut self) -> Result<()> {
        Err(HleError::Unsupported("Queue::reset_memory_usage_counts"))
    }
}

/// Whether an external-sync dependency needs an explicit barrier.
///
/// A fence value the queue's own ordering value already covers is
/// satisfied by program order; inserting a barrier for it would be
/// redundant.
fn needs_barrier(queue_max: u64, sync_value: u64) -> bool {
    queue_max < sync_value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = QueueBuilder::new();
        assert_eq!(builder.command_flush_threshold(), 256);
        assert_eq!(builder.queue_memory_size(), QUEUE_PAGE_SIZE);
        assert!(builder.queue_memory().is_null());
    }

    #[test]
    fn no_redundant_barrier_when_program_order_covers_the_fence() {
        // Fence at 5 with the queue's ordering value already at 7
        assert!(!needs_barrier(7, 5));
        assert!(!needs_barrier(5, 5));
        assert!(needs_barrier(3, 5));
    }

    #[test]
    fn builder_records_sizes() {
        let mut builder = QueueBuilder::new();
        builder.set_command_memory_size(0x10000);
        builder.set_compute_memory_size(0x8000);
        builder.set_control_memory_size(0x1000);
        builder.set_command_flush_threshold(64);

        assert_eq!(builder.command_memory_size(), 0x10000);
        assert_eq!(builder.compute_memory_size(), 0x8000);
        assert_eq!(builder.control_memory_size(), 0x1000);
        assert_eq!(builder.command_flush_threshold(), 64);
    }
}
