//! Guest-visible fences.
//!
//! A `Sync` carries one timeline value; 0 means "not pending". Queues and
//! windows fence syncs with freshly reserved values, and guests observe
//! completion only by waiting here.

use crate::device::Device;
use ash::vk;
use bitflags::bitflags;
use prism_gpu::WaitResult;
use std::sync::Arc;

/// What a fence waits for before signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCondition {
    /// All GPU work queued so far, any pipeline.
    AllGpuCommandsComplete,
    /// Graphics world-space stages only.
    GraphicsWorldSpaceComplete,
}

impl SyncCondition {
    /// The pipeline stages the fence's wait applies to.
    pub(crate) fn wait_stage_mask(self) -> vk::PipelineStageFlags2 {
        match self {
            Self::AllGpuCommandsComplete => vk::PipelineStageFlags2::ALL_COMMANDS,
            Self::GraphicsWorldSpaceComplete => vk::PipelineStageFlags2::ALL_GRAPHICS,
        }
    }
}

bitflags! {
    /// Guest fence flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncFlags: u32 {
        const FLUSH_FOR_CPU = 1 << 0;
    }
}

/// Result of waiting on a guest fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWaitResult {
    /// The fence was already satisfied; the wait did not block.
    AlreadySignalled,
    /// The wait blocked and the condition was satisfied.
    ConditionSatisfied,
    /// The wait blocked and the timeout expired first.
    TimeoutExpired,
    /// The host wait failed.
    Failed,
}

/// A guest fence.
pub struct Sync {
    device: Arc<Device>,
    timeline_value: u64,
    debug_label: Option<String>,
}

impl Sync {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            timeline_value: 0,
            debug_label: None,
        }
    }

    pub fn set_debug_label(&mut self, label: impl Into<String>) {
        self.debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    /// Record the timeline value this fence represents.
    pub(crate) fn fence(&mut self, timeline_value: u64) {
        self.timeline_value = timeline_value;
    }

    /// Whether a fence value has been recorded.
    pub(crate) fn waiting(&self) -> bool {
        self.timeline_value != 0
    }

    pub(crate) fn timeline_value(&self) -> u64 {
        self.timeline_value
    }

    /// Block until the fence is satisfied, up to `timeout_ns`.
    ///
    /// Only the caller blocks; the awaited work is never abandoned. A fence
    /// that was never recorded reports [`SyncWaitResult::AlreadySignalled`].
    pub fn wait(&self, timeout_ns: u64) -> SyncWaitResult {
        match self
            .device
            .scheduler()
            .wait_timeline(self.timeline_value, timeout_ns)
        {
            Ok(WaitResult::AlreadySignaled) => SyncWaitResult::AlreadySignalled,
            Ok(WaitResult::Signalled) => SyncWaitResult::ConditionSatisfied,
            Ok(WaitResult::TimedOut) => SyncWaitResult::TimeoutExpired,
            Err(e) => {
                tracing::error!("Fence wait failed: {e}");
                SyncWaitResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_selects_wait_stages() {
        assert_eq!(
            SyncCondition::AllGpuCommandsComplete.wait_stage_mask(),
            vk::PipelineStageFlags2::ALL_COMMANDS
        );
        assert_eq!(
            SyncCondition::GraphicsWorldSpaceComplete.wait_stage_mask(),
            vk::PipelineStageFlags2::ALL_GRAPHICS
        );
    }
}
