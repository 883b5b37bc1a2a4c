//! Command scheduling onto the single host queue.
//!
//! Guest threads never touch the host queue. They describe the wait/signal
//! operation they need and enqueue it here; one worker thread owns all
//! submissions and performs them in strict FIFO order. Combined with the
//! timeline wait/signal values carried by each operation this reproduces
//! the guest API's in-order execution per logical queue on a single
//! physical queue.
//!
//! Completion is observed through one shared timeline semaphore: callers
//! block in [`CommandScheduler::wait_timeline`] until the semaphore reaches
//! their value.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Timeline bookkeeping shared by all callers.
///
/// `max` is the last value promised to any caller, `min` the last value
/// observed signaled. Both start at 0; 0 means "unset/not pending", so the
/// first reserved value is 1.
#[derive(Debug, Default)]
pub struct Timeline {
    max: AtomicU64,
    min: AtomicU64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve the next timeline value.
    pub fn reserve(&self) -> u64 {
        self.max.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether `value` is already covered by the cached minimum.
    pub fn is_signaled(&self, value: u64) -> bool {
        self.min.load(Ordering::Relaxed) >= value
    }

    /// Advance the cached minimum to at least `value`.
    ///
    /// Monotonic: concurrent callers can never move the minimum backwards.
    pub fn advance_min(&self, value: u64) {
        let mut prev = self.min.load(Ordering::Relaxed);
        while prev < value {
            match self
                .min
                .compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => prev = observed,
            }
        }
    }

    /// The last value handed out by [`Timeline::reserve`].
    pub fn last_reserved(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

/// Result of a timeline wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The value was already covered by the cached minimum; no wait happened.
    AlreadySignaled,
    /// The wait blocked and the value was reached.
    Signalled,
    /// The wait blocked and the timeout expired first.
    TimedOut,
}

/// A non-timeline semaphore plus a "submission observed" flag.
///
/// The host presentation primitives cannot consume timeline semaphores, so
/// the acquire/present handshake runs on binary semaphores. The flag and
/// condvar let one side block until the queue submission involving the
/// semaphore has actually been made.
pub struct BinarySemaphore {
    semaphore: vk::Semaphore,
    submitted: Mutex<bool>,
    submitted_cv: Condvar,
}

impl BinarySemaphore {
    pub fn new(semaphore: vk::Semaphore) -> Self {
        Self {
            semaphore,
            submitted: Mutex::new(false),
            submitted_cv: Condvar::new(),
        }
    }

    /// The underlying semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Mark the semaphore's submission as made and wake all waiters.
    pub fn mark_submitted(&self) {
        {
            let mut submitted = self.submitted.lock();
            *submitted = true;
        }
        self.submitted_cv.notify_all();
    }

    /// Block until [`BinarySemaphore::mark_submitted`] has been called.
    pub fn wait_submitted(&self) {
        let mut submitted = self.submitted.lock();
        while !*submitted {
            self.submitted_cv.wait(&mut submitted);
        }
    }
}

/// A wait/signal submission to perform on the host queue.
pub struct SyncOperation {
    /// Timeline value the submission waits on.
    pub wait_timeline_value: u64,
    /// Timeline value the submission signals.
    pub signal_timeline_value: u64,
    /// Stages the wait applies to.
    pub wait_stage_mask: vk::PipelineStageFlags2,
    /// Stages the signal applies to.
    pub signal_stage_mask: vk::PipelineStageFlags2,
    /// Binary semaphore to wait on, e.g. the native acquire signal.
    pub wait_binary: Option<Arc<BinarySemaphore>>,
    /// Binary semaphore to signal, e.g. for the native present to consume.
    pub signal_binary: Option<Arc<BinarySemaphore>>,
}

impl Default for SyncOperation {
    fn default() -> Self {
        Self {
            wait_timeline_value: 0,
            signal_timeline_value: 0,
            wait_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            signal_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            wait_binary: None,
            signal_binary: None,
        }
    }
}

/// An operation queued for the worker.
pub enum Operation {
    Sync(SyncOperation),
    /// Internal: drains the queue and stops the worker.
    Shutdown,
}

struct Shared {
    context: Arc<GpuContext>,
    timeline_semaphore: vk::Semaphore,
    timeline: Timeline,
    operations: Mutex<VecDeque<Operation>>,
    operations_cv: Condvar,
    /// Binary semaphores whose operations have been submitted; destroyed at
    /// scheduler teardown once the queue has gone idle.
    retired: Mutex<Vec<Arc<BinarySemaphore>>>,
}

/// Serializes all guest-driven submissions onto the one host queue.
pub struct CommandScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl CommandScheduler {
    /// Create the scheduler and start its worker thread.
    pub fn new(context: Arc<GpuContext>) -> Result<Self> {
        let timeline_semaphore = unsafe { create_timeline_semaphore(context.device()) }?;

        let shared = Arc::new(Shared {
            context,
            timeline_semaphore,
            timeline: Timeline::new(),
            operations: Mutex::new(VecDeque::new()),
            operations_cv: Condvar::new(),
            retired: Mutex::new(Vec::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("prism-scheduler".to_string())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(|e| GpuError::Other(format!("Failed to spawn scheduler worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Atomically reserve and return the next timeline value.
    pub fn incr_timeline(&self) -> u64 {
        self.shared.timeline.reserve()
    }

    /// Create a fresh binary semaphore for an acquire/present hand-off.
    pub fn create_binary_semaphore(&self) -> Result<Arc<BinarySemaphore>> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.shared.context.device().create_semaphore(&info, None)? };
        Ok(Arc::new(BinarySemaphore::new(semaphore)))
    }

    /// Build an operation and push it onto the FIFO.
    ///
    /// The factory runs under the FIFO lock, so the state it captures (e.g.
    /// a queue's current ordering value) is consistent with the operation's
    /// position in the queue.
    pub fn gen_and_queue_operation(&self, factory: impl FnOnce() -> Operation) {
        {
            let mut operations = self.shared.operations.lock();
            operations.push_back(factory());
        }
        self.shared.operations_cv.notify_one();
    }

    /// Block the calling thread until the timeline reaches `value`.
    ///
    /// Returns [`WaitResult::AlreadySignaled`] without touching the host
    /// API when the cached minimum already covers `value`. The timeout
    /// bounds only how long the caller blocks; the awaited work is never
    /// abandoned.
    pub fn wait_timeline(&self, value: u64, timeout_ns: u64) -> Result<WaitResult> {
        if self.shared.timeline.is_signaled(value) {
            return Ok(WaitResult::AlreadySignaled);
        }

        let semaphores = [self.shared.timeline_semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        let result = unsafe {
            self.shared
                .context
                .device()
                .wait_semaphores(&wait_info, timeout_ns)
        };

        match result {
            Ok(()) => {
                self.shared.timeline.advance_min(value);
                Ok(WaitResult::Signalled)
            }
            Err(vk::Result::TIMEOUT) => Ok(WaitResult::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    /// Hook for forcing an eager drain of the worker; currently a no-op.
    pub fn flush(&self) {}
}

impl Drop for CommandScheduler {
    fn drop(&mut self) {
        {
            let mut operations = self.shared.operations.lock();
            operations.push_back(Operation::Shutdown);
        }
        self.shared.operations_cv.notify_one();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        // All submissions have been made; wait for them to finish before
        // destroying semaphores.
        let _ = self.shared.context.wait_idle();

        let device = self.shared.context.device();
        unsafe {
            device.destroy_semaphore(self.shared.timeline_semaphore, None);
        }
        for semaphore in self.shared.retired.lock().drain(..) {
            unsafe {
                device.destroy_semaphore(semaphore.handle(), None);
            }
        }
    }
}

/// Create the scheduler's timeline semaphore with an initial value of 0.
unsafe fn create_timeline_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

    let semaphore = device.create_semaphore(&info, None)?;
    Ok(semaphore)
}

fn worker_loop(shared: &Shared) {
    loop {
        let operation = next_operation(shared);
        match operation {
            Operation::Shutdown => break,
            Operation::Sync(op) => submit_sync(shared, op),
        }
    }
}

fn next_operation(shared: &Shared) -> Operation {
    let mut operations = shared.operations.lock();
    loop {
        if let Some(operation) = operations.pop_front() {
            return operation;
        }
        shared.operations_cv.wait(&mut operations);
    }
}

fn submit_sync(shared: &Shared, op: SyncOperation) {
    // The wait semaphore must have been handed to its signaling party (the
    // native acquire) before a submission may wait on it. Block until then;
    // skipping the wait would silently drop the dependency.
    if let Some(wait_binary) = &op.wait_binary {
        wait_binary.wait_submitted();
    }

    let mut wait_infos = Vec::with_capacity(2);
    wait_infos.push(
        vk::SemaphoreSubmitInfo::default()
            .semaphore(shared.timeline_semaphore)
            .value(op.wait_timeline_value)
            .stage_mask(op.wait_stage_mask),
    );
    if let Some(wait_binary) = &op.wait_binary {
        wait_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(wait_binary.handle())
                .stage_mask(op.wait_stage_mask),
        );
    }

    let mut signal_infos = Vec::with_capacity(2);
    signal_infos.push(
        vk::SemaphoreSubmitInfo::default()
            .semaphore(shared.timeline_semaphore)
            .value(op.signal_timeline_value)
            .stage_mask(op.signal_stage_mask),
    );
    if let Some(signal_binary) = &op.signal_binary {
        signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(signal_binary.handle())
                .stage_mask(op.signal_stage_mask),
        );
    }

    let submit_info = vk::SubmitInfo2::default()
        .wait_semaphore_infos(&wait_infos)
        .signal_semaphore_infos(&signal_infos);

    let submit_result = {
        let (queue_mutex, queue) = shared.context.queue();
        let _guard = queue_mutex.lock();
        unsafe {
            shared
                .context
                .device()
                .queue_submit2(queue, &[submit_info], vk::Fence::null())
        }
    };

    if let Err(e) = submit_result {
        // A single worker services every submission; there is no retry or
        // rollback path once the queue is in an unknown state.
        tracing::error!("Host queue submission failed: {e}");
        panic!("unrecoverable host queue submission failure: {e}");
    }

    tracing::trace!(
        wait = op.wait_timeline_value,
        signal = op.signal_timeline_value,
        "submitted sync operation"
    );

    if let Some(signal_binary) = op.signal_binary {
        signal_binary.mark_submitted();
        shared.retired.lock().push(signal_binary);
    }
    if let Some(wait_binary) = op.wait_binary {
        shared.retired.lock().push(wait_binary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn reserve_starts_at_one() {
        let timeline = Timeline::new();
        assert_eq!(timeline.reserve(), 1);
        assert_eq!(timeline.reserve(), 2);
        assert_eq!(timeline.last_reserved(), 2);
    }

    #[test]
    fn zero_is_always_signaled() {
        let timeline = Timeline::new();
        assert!(timeline.is_signaled(0));
        assert!(!timeline.is_signaled(1));
    }

    #[test]
    fn concurrent_reserve_yields_distinct_dense_values() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let timeline = Arc::new(Timeline::new());
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let timeline = Arc::clone(&timeline);
            handles.push(std::thread::spawn(move || {
                let mut values = Vec::with_capacity(PER_THREAD);
                for _ in 0..PER_THREAD {
                    values.push(timeline.reserve());
                }
                values
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        // No duplicates or gaps
        let expected: Vec<u64> = (1..=(THREADS * PER_THREAD) as u64).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn per_thread_reserve_order_is_strictly_increasing() {
        let timeline = Timeline::new();
        let mut previous = 0;
        for _ in 0..100 {
            let value = timeline.reserve();
            assert!(value > previous);
            previous = value;
        }
    }

    #[test]
    fn advance_min_never_regresses() {
        let timeline = Timeline::new();
        timeline.advance_min(10);
        assert!(timeline.is_signaled(10));

        timeline.advance_min(5);
        assert!(timeline.is_signaled(10));

        timeline.advance_min(12);
        assert!(timeline.is_signaled(12));
        assert!(!timeline.is_signaled(13));
    }

    #[test]
    fn advance_min_is_monotonic_under_concurrency() {
        let timeline = Arc::new(Timeline::new());
        let mut handles = Vec::new();
        for start in 0..8u64 {
            let timeline = Arc::clone(&timeline);
            handles.push(std::thread::spawn(move || {
                for value in (start..1000).step_by(8) {
                    timeline.advance_min(value);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(timeline.is_signaled(999));
    }

    #[test]
    fn binary_semaphore_unblocks_exactly_on_mark() {
        let semaphore = Arc::new(BinarySemaphore::new(vk::Semaphore::null()));
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                semaphore.wait_submitted();
                woke.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));

        semaphore.mark_submitted();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn binary_semaphore_wait_after_mark_returns_immediately() {
        let semaphore = BinarySemaphore::new(vk::Semaphore::null());
        semaphore.mark_submitted();
        semaphore.wait_submitted();
    }
}
