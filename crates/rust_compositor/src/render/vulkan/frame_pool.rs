//! Fence-gated ring of per-frame resources
//!
//! The pool has no fixed frames-in-flight count. Each acquire reuses the
//! first context the GPU has finished with and moves it to the back of the
//! ring; when every context is still busy a new one is created. The pool
//! therefore settles at one more context than the GPU lags behind the CPU.

use super::commands::CommandPool;
use super::descriptors::DescriptorAllocator;
use super::memory::{GpuBuffer, TransientBuffers};
use super::sync::Fence;
use super::{VulkanError, VulkanResult};
use ash::{vk, Device};
use std::collections::VecDeque;

/// Creates, inspects and recycles the frames held by a [`FrameResourcePool`]
pub trait FrameBackend {
    /// Per-frame resource bundle
    type Frame;

    /// Build a brand-new frame
    fn create_frame(&mut self) -> VulkanResult<Self::Frame>;

    /// Whether the GPU no longer uses `frame`
    fn is_reusable(&self, frame: &Self::Frame) -> VulkanResult<bool>;

    /// Prepare a reusable frame for recording again
    fn recycle(&mut self, frame: &mut Self::Frame) -> VulkanResult<()>;

    /// Submission serial of `frame` while it is in flight
    fn in_flight_serial(&self, _frame: &Self::Frame) -> Option<u64> {
        None
    }
}

/// Insertion-ordered pool of frames recycled by completion
pub struct FrameResourcePool<B: FrameBackend> {
    frames: VecDeque<B::Frame>,
    backend: B,
}

impl<B: FrameBackend> FrameResourcePool<B> {
    /// Create an empty pool
    pub const fn new(backend: B) -> Self {
        Self {
            frames: VecDeque::new(),
            backend,
        }
    }

    /// Hand out a frame ready for recording
    ///
    /// The returned frame sits at the back of the ring.
    pub fn acquire(&mut self) -> VulkanResult<&mut B::Frame> {
        let mut reusable = None;
        for (index, frame) in self.frames.iter().enumerate() {
            if self.backend.is_reusable(frame)? {
                reusable = Some(index);
                break;
            }
        }

        if let Some(mut frame) = reusable.and_then(|index| self.frames.remove(index)) {
            let recycled = self.backend.recycle(&mut frame);
            self.frames.push_back(frame);
            recycled?;
        } else {
            let frame = self.backend.create_frame()?;
            self.frames.push_back(frame);
            log::debug!("Frame pool grew to {} contexts", self.frames.len());
        }

        self.frames.back_mut().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "frame pool is empty after acquire".to_string(),
        })
    }

    /// Number of frames created so far
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was created yet
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in ring order, least recently acquired first
    pub fn frames(&self) -> impl Iterator<Item = &B::Frame> {
        self.frames.iter()
    }

    /// Oldest submission serial that may still be executing
    pub fn oldest_in_flight(&self) -> Option<u64> {
        self.frames
            .iter()
            .filter_map(|frame| self.backend.in_flight_serial(frame))
            .min()
    }

    /// Newest serial whose work is known to be finished
    ///
    /// Everything up to `last_submitted` is done when no frame is still
    /// executing; otherwise everything before the oldest executing serial.
    /// `None` when even the first serial may still be running.
    pub fn completed_serial(&self, last_submitted: u64) -> VulkanResult<Option<u64>> {
        let mut oldest: Option<u64> = None;
        for frame in &self.frames {
            let Some(serial) = self.backend.in_flight_serial(frame) else {
                continue;
            };
            if !self.backend.is_reusable(frame)? {
                oldest = Some(oldest.map_or(serial, |current| current.min(serial)));
            }
        }
        Ok(oldest.map_or(Some(last_submitted), |serial| serial.checked_sub(1)))
    }

    /// Access the backend
    pub const fn backend(&self) -> &B {
        &self.backend
    }
}

/// Lifecycle of a [`FrameContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Not submitted since creation or the last recycle
    Idle,
    /// Submitted; its fence signals on completion
    InFlight,
}

/// Resources of one repaint
pub struct FrameContext {
    /// Primary command buffer, reset on every begin
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the submission completes
    pub fence: Fence,
    /// Uniform and texture bindings
    pub descriptor_set: vk::DescriptorSet,
    /// Vertex, index and uniform buffers of the current repaint
    pub transient: Option<TransientBuffers>,
    /// Upload buffer used when transient memory is not host-visible
    pub staging: Option<GpuBuffer>,
    state: FrameState,
    serial: u64,
}

impl FrameContext {
    /// Current lifecycle state
    pub const fn state(&self) -> FrameState {
        self.state
    }

    /// Record that the frame was submitted as `serial`
    pub fn mark_submitted(&mut self, serial: u64) {
        self.state = FrameState::InFlight;
        self.serial = serial;
    }

    /// Serial of the pending submission, if any
    pub const fn pending_serial(&self) -> Option<u64> {
        match self.state {
            FrameState::InFlight => Some(self.serial),
            FrameState::Idle => None,
        }
    }
}

/// Builds [`FrameContext`]s on a Vulkan device
pub struct FrameFactory {
    descriptors: DescriptorAllocator,
    command_pool: CommandPool,
    layout: vk::DescriptorSetLayout,
    device: Device,
}

impl FrameFactory {
    /// Frames record on `queue_family` and bind sets of `layout`
    pub fn new(
        device: Device,
        queue_family: u32,
        layout: vk::DescriptorSetLayout,
        descriptors: DescriptorAllocator,
    ) -> VulkanResult<Self> {
        Ok(Self {
            command_pool: CommandPool::new(device.clone(), queue_family)?,
            descriptors,
            layout,
            device,
        })
    }

    /// Device the frames are created on
    pub const fn device(&self) -> &Device {
        &self.device
    }
}

impl FrameBackend for FrameFactory {
    type Frame = FrameContext;

    fn create_frame(&mut self) -> VulkanResult<FrameContext> {
        Ok(FrameContext {
            command_buffer: self.command_pool.allocate_command_buffer()?,
            fence: Fence::new(self.device.clone(), false)?,
            descriptor_set: self.descriptors.allocate(self.layout)?,
            transient: None,
            staging: None,
            state: FrameState::Idle,
            serial: 0,
        })
    }

    fn is_reusable(&self, frame: &FrameContext) -> VulkanResult<bool> {
        match frame.state {
            FrameState::Idle => Ok(true),
            FrameState::InFlight => frame.fence.is_signaled(),
        }
    }

    fn recycle(&mut self, frame: &mut FrameContext) -> VulkanResult<()> {
        if frame.state == FrameState::InFlight {
            frame.fence.reset()?;
        }
        frame.transient = None;
        frame.staging = None;
        frame.state = FrameState::Idle;
        Ok(())
    }

    fn in_flight_serial(&self, frame: &FrameContext) -> Option<u64> {
        frame.pending_serial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::texture::RetireQueue;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug)]
    struct MockFrame {
        id: usize,
        submitted: Option<u64>,
        recycled: usize,
    }

    /// GPU that finishes a submission `lag` acquires after it was made
    struct MockGpu {
        now: Rc<Cell<u64>>,
        lag: u64,
        created: usize,
    }

    impl FrameBackend for MockGpu {
        type Frame = MockFrame;

        fn create_frame(&mut self) -> VulkanResult<MockFrame> {
            self.created += 1;
            Ok(MockFrame {
                id: self.created - 1,
                submitted: None,
                recycled: 0,
            })
        }

        fn is_reusable(&self, frame: &MockFrame) -> VulkanResult<bool> {
            Ok(frame
                .submitted
                .map_or(true, |serial| serial + self.lag < self.now.get()))
        }

        fn recycle(&mut self, frame: &mut MockFrame) -> VulkanResult<()> {
            frame.submitted = None;
            frame.recycled += 1;
            Ok(())
        }

        fn in_flight_serial(&self, frame: &MockFrame) -> Option<u64> {
            frame.submitted
        }
    }

    fn pool_with_lag(lag: u64) -> (FrameResourcePool<MockGpu>, Rc<Cell<u64>>) {
        let now = Rc::new(Cell::new(0));
        let gpu = MockGpu {
            now: Rc::clone(&now),
            lag,
            created: 0,
        };
        (FrameResourcePool::new(gpu), now)
    }

    fn run(pool: &mut FrameResourcePool<MockGpu>, now: &Cell<u64>, frames: u64) {
        for serial in 0..frames {
            now.set(serial);
            let frame = pool.acquire().unwrap();
            frame.submitted = Some(serial);
        }
    }

    #[test]
    fn test_pool_size_tracks_gpu_lag() {
        for lag in 0..5 {
            let (mut pool, now) = pool_with_lag(lag);
            run(&mut pool, &now, 200);
            assert_eq!(pool.len(), lag as usize + 1, "lag {lag}");
        }
    }

    #[test]
    fn test_never_reuses_busy_frame() {
        let (mut pool, now) = pool_with_lag(3);
        for serial in 0..50 {
            now.set(serial);
            let busy: Vec<usize> = pool
                .frames()
                .filter(|frame| !pool.backend().is_reusable(frame).unwrap())
                .map(|frame| frame.id)
                .collect();
            let frame = pool.acquire().unwrap();
            assert!(!busy.contains(&frame.id), "frame {} reused while busy", frame.id);
            frame.submitted = Some(serial);
        }
    }

    #[test]
    fn test_reuse_rotates_to_back() {
        let (mut pool, now) = pool_with_lag(0);
        // Three frames all submitted at the same instant
        now.set(0);
        for _ in 0..3 {
            let frame = pool.acquire().unwrap();
            frame.submitted = Some(0);
        }
        assert_eq!(pool.len(), 3);

        now.set(10);
        let order: Vec<usize> = (0..6)
            .map(|_| {
                let frame = pool.acquire().unwrap();
                frame.id
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_idle_frame_reused_without_submission() {
        let (mut pool, _now) = pool_with_lag(10);
        let first = pool.acquire().unwrap().id;
        // Recording aborted before submit; the frame is immediately reusable
        let second = pool.acquire().unwrap();
        assert_eq!(second.id, first);
        assert_eq!(second.recycled, 1);
        assert_eq!(pool.len(), 1);
    }

    fn submit_at(pool: &mut FrameResourcePool<MockGpu>, now: &Cell<u64>, serial: u64) {
        now.set(serial);
        pool.acquire().unwrap().submitted = Some(serial);
    }

    #[test]
    fn test_retired_item_kept_while_older_frames_run() {
        let (mut pool, now) = pool_with_lag(2);
        let mut retired = RetireQueue::default();
        for serial in 1..=3 {
            submit_at(&mut pool, &now, serial);
        }
        retired.push(1, "early");
        retired.push(3, "late");

        // Serials 1..=3 all still executing
        assert_eq!(pool.completed_serial(3).unwrap(), Some(0));
        assert_eq!(retired.collect(0), 0);

        // Serial 1 finished, 2 and 3 still executing
        now.set(4);
        let completed = pool.completed_serial(3).unwrap().unwrap();
        assert_eq!(completed, 1);
        assert_eq!(retired.collect(completed), 1);
        assert_eq!(retired.len(), 1);

        // Everything up to serial 3 finished
        now.set(6);
        let completed = pool.completed_serial(3).unwrap().unwrap();
        assert_eq!(completed, 3);
        assert_eq!(retired.collect(completed), 1);
        assert!(retired.is_empty());
    }

    #[test]
    fn test_retired_item_released_when_nothing_in_flight() {
        let (mut pool, _now) = pool_with_lag(4);
        let mut retired = RetireQueue::default();
        retired.push(5, ());
        assert_eq!(pool.completed_serial(5).unwrap(), Some(5));

        // An acquired but never submitted frame does not hold anything back
        pool.acquire().unwrap();
        let completed = pool.completed_serial(5).unwrap().unwrap();
        assert_eq!(retired.collect(completed), 1);
    }

    #[test]
    fn test_first_serial_in_flight_completes_nothing() {
        let (mut pool, now) = pool_with_lag(3);
        submit_at(&mut pool, &now, 0);
        assert_eq!(pool.completed_serial(0).unwrap(), None);
    }

    #[test]
    fn test_oldest_in_flight() {
        let (mut pool, now) = pool_with_lag(5);
        assert_eq!(pool.oldest_in_flight(), None);
        run(&mut pool, &now, 4);
        assert_eq!(pool.oldest_in_flight(), Some(0));

        now.set(7);
        // Serials 0 and 1 are done; acquiring recycles serial 0's frame
        pool.acquire().unwrap();
        assert_eq!(pool.oldest_in_flight(), Some(1));
    }
}
