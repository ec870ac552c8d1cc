//! Synchronization primitives.
//!
//! Each frame slot owns an image-acquired semaphore, a render-complete
//! semaphore and a drawing fence. The fence guards reuse of the whole slot
//! (command buffer and both semaphores); it is unrelated to which swapchain
//! image the slot happens to render into.

use crate::error::{GpuError, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Timeout value that makes a fence wait block indefinitely.
pub const INFINITE_TIMEOUT: u64 = u64::MAX;

/// Fence operations the frame protocol relies on.
///
/// Implemented by the real device and by test doubles, so the ordering rules
/// of the frame protocol can be exercised without a GPU.
pub trait FenceDriver {
    /// Wait for `fence`; `Err(vk::Result::TIMEOUT)` if it did not signal in time.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    /// Return `fence` to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> VkResult<()>;
}

impl FenceDriver for ash::Device {
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.reset_fences(&[fence]) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device_wait_idle() }
    }
}

/// Block until `fence` signals, retrying while the driver reports a timeout.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fence<D: FenceDriver + ?Sized>(driver: &D, fence: vk::Fence) -> Result<()> {
    loop {
        match driver.wait_for_fence(fence, INFINITE_TIMEOUT) {
            Ok(()) => return Ok(()),
            Err(vk::Result::TIMEOUT) => continue,
            Err(e) => {
                tracing::error!("Fence wait failed: {e}");
                return Err(GpuError::from(e));
            }
        }
    }
}

/// Check whether `fence` has signaled without blocking.
pub fn fence_signaled<D: FenceDriver + ?Sized>(driver: &D, fence: vk::Fence) -> Result<bool> {
    match driver.wait_for_fence(fence, 0) {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(e) => {
            tracing::error!("Fence poll failed: {e}");
            Err(GpuError::from(e))
        }
    }
}

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Synchronization objects for one frame slot.
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be rendered to.
    pub image_acquired: vk::Semaphore,
    /// Signaled when the slot's submission finished rendering.
    pub render_complete: vk::Semaphore,
    /// Signaled when the slot's submission completed on the GPU.
    pub drawing: vk::Fence,
    device: Arc<ash::Device>,
}

impl FrameSync {
    /// Create the sync objects; the fence starts signaled so the first wait
    /// on a fresh slot returns immediately.
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        unsafe {
            let image_acquired = create_semaphore(&device)?;
            let render_complete = match create_semaphore(&device) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_acquired, None);
                    return Err(e);
                }
            };
            let drawing = match create_fence(&device, true) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_acquired, None);
                    device.destroy_semaphore(render_complete, None);
                    return Err(e);
                }
            };

            Ok(Self {
                image_acquired,
                render_complete,
                drawing,
                device,
            })
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.image_acquired, None);
            self.device.destroy_semaphore(self.render_complete, None);
            self.device.destroy_fence(self.drawing, None);
        }
    }
}

/// Manages synchronization for multiple frames in flight.
pub struct FrameSyncManager {
    frame_syncs: Vec<FrameSync>,
    current_frame: usize,
}

impl FrameSyncManager {
    /// Create a sync manager for the given number of frames in flight.
    pub fn new(device: &Arc<ash::Device>, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "At least one frame in flight is required".to_string(),
            ));
        }

        let frame_syncs = (0..frames_in_flight)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|e| tracing::error!("Frame sync creation failed: {e}"))?;

        Ok(Self {
            frame_syncs,
            current_frame: 0,
        })
    }

    /// Get the current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frame_syncs[self.current_frame]
    }

    /// Drawing fence of a frame slot.
    pub fn fence(&self, slot: usize) -> Option<vk::Fence> {
        self.frame_syncs.get(slot).map(|sync| sync.drawing)
    }

    /// Advance to the next frame.
    pub fn advance(&mut self) {
        self.current_frame = next_slot(self.current_frame, self.frame_syncs.len());
    }

    /// Get the current frame index.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Slot used by the frame before the current one.
    ///
    /// Its fence covers the most recent submission, and with a single
    /// graphics queue every submission before it as well.
    pub fn previous_frame(&self) -> usize {
        previous_slot(self.current_frame, self.frame_syncs.len())
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frame_syncs.len()
    }
}

/// Slot that follows `slot` in a ring of `count` slots.
pub fn next_slot(slot: usize, count: usize) -> usize {
    (slot + 1) % count
}

/// Slot that precedes `slot` in a ring of `count` slots.
pub fn previous_slot(slot: usize, count: usize) -> usize {
    (slot + count - 1) % count
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::Cell;

    /// Reports `TIMEOUT` a fixed number of times before signaling.
    struct SlowFence {
        timeouts_left: Cell<u32>,
        waits: Cell<u32>,
        fail_with: Option<vk::Result>,
    }

    impl SlowFence {
        fn new(timeouts: u32) -> Self {
            Self {
                timeouts_left: Cell::new(timeouts),
                waits: Cell::new(0),
                fail_with: None,
            }
        }
    }

    impl FenceDriver for SlowFence {
        fn wait_for_fence(&self, _fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
            self.waits.set(self.waits.get() + 1);
            if let Some(e) = self.fail_with {
                return Err(e);
            }
            match self.timeouts_left.get() {
                0 => Ok(()),
                n => {
                    self.timeouts_left.set(n - 1);
                    Err(vk::Result::TIMEOUT)
                }
            }
        }

        fn reset_fence(&self, _fence: vk::Fence) -> VkResult<()> {
            Ok(())
        }

        fn wait_idle(&self) -> VkResult<()> {
            Ok(())
        }
    }

    #[test]
    fn blocking_wait_retries_on_timeout() {
        let driver = SlowFence::new(3);
        wait_for_fence(&driver, vk::Fence::from_raw(1)).unwrap();
        assert_eq!(driver.waits.get(), 4);
    }

    #[test]
    fn blocking_wait_propagates_device_loss() {
        let driver = SlowFence {
            fail_with: Some(vk::Result::ERROR_DEVICE_LOST),
            ..SlowFence::new(0)
        };
        let err = wait_for_fence(&driver, vk::Fence::from_raw(1)).unwrap_err();
        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    fn poll_does_not_block() {
        let driver = SlowFence::new(1);
        let fence = vk::Fence::from_raw(1);
        assert!(!fence_signaled(&driver, fence).unwrap());
        assert!(fence_signaled(&driver, fence).unwrap());
        assert_eq!(driver.waits.get(), 2);
    }

    #[test]
    fn slots_wrap_around() {
        assert_eq!(next_slot(0, 2), 1);
        assert_eq!(next_slot(1, 2), 0);
        assert_eq!(next_slot(0, 1), 0);
        assert_eq!(previous_slot(0, 2), 1);
        assert_eq!(previous_slot(2, 3), 1);
        assert_eq!(previous_slot(0, 1), 0);
    }
}
