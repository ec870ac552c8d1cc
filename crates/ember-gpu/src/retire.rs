//! Deferred destruction of replaced swapchains.
//!
//! When a swapchain is recreated the GPU may still be rendering into, or
//! presenting from, the previous one. The previous swapchain is parked here
//! together with the frame slot whose fence covers its last submission, and
//! dropped once that fence has signaled.
//!
//! At most one swapchain is parked at a time. Replacing the swapchain again
//! while one is parked drains the device first.

use crate::error::Result;

/// A replaced swapchain waiting for its last frame to finish.
#[derive(Debug)]
pub struct OldSwapchain<S> {
    swapchain: S,
    frame_index: usize,
}

impl<S> OldSwapchain<S> {
    /// Frame slot whose fence must signal before the swapchain can go.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn swapchain(&self) -> &S {
        &self.swapchain
    }
}

/// Holder for at most one retired swapchain.
#[derive(Debug)]
pub struct SwapchainRetirement<S> {
    pending: Option<OldSwapchain<S>>,
    forced_idle_waits: u64,
}

impl<S> Default for SwapchainRetirement<S> {
    fn default() -> Self {
        Self {
            pending: None,
            forced_idle_waits: 0,
        }
    }
}

impl<S> SwapchainRetirement<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a retired swapchain is still alive.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&OldSwapchain<S>> {
        self.pending.as_ref()
    }

    /// How many times a second replacement had to drain the device.
    pub fn forced_idle_waits(&self) -> u64 {
        self.forced_idle_waits
    }

    /// Drop the retired swapchain if its frame has completed.
    ///
    /// `fence_signaled` is asked, without blocking, whether the fence of the
    /// stored frame slot has signaled. Returns `true` if a swapchain was
    /// released.
    pub fn poll<F>(&mut self, fence_signaled: F) -> Result<bool>
    where
        F: FnOnce(usize) -> Result<bool>,
    {
        let Some(old) = &self.pending else {
            return Ok(false);
        };

        if !fence_signaled(old.frame_index)? {
            tracing::trace!(
                "Old swapchain still in flight (frame slot {})",
                old.frame_index
            );
            return Ok(false);
        }

        tracing::debug!("Releasing old swapchain (frame slot {})", old.frame_index);
        self.pending = None;
        Ok(true)
    }

    /// Make sure nothing is parked before another replacement.
    ///
    /// If a swapchain is still parked, `wait_idle` is called to drain the
    /// device and the parked swapchain is dropped.
    pub fn make_room<F>(&mut self, wait_idle: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.pending.is_none() {
            return Ok(());
        }

        tracing::warn!("Swapchain replaced again before the previous one retired, waiting for idle");
        wait_idle()?;
        self.forced_idle_waits += 1;
        self.pending = None;
        Ok(())
    }

    /// Park `old` until the fence of `frame_index` signals.
    ///
    /// Calls [`Self::make_room`] first, so a second retiree never coexists
    /// with the first.
    pub fn retire<F>(&mut self, old: S, frame_index: usize, wait_idle: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.make_room(wait_idle)?;
        self.pending = Some(OldSwapchain {
            swapchain: old,
            frame_index,
        });
        Ok(())
    }

    /// Drop any parked swapchain unconditionally.
    ///
    /// The caller must already have waited for the device to go idle.
    pub fn flush(&mut self) {
        if self.pending.take().is_some() {
            tracing::debug!("Flushed old swapchain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use ash::vk;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Records its id when dropped.
    struct Tracked {
        id: u32,
        dropped: Rc<RefCell<Vec<u32>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.borrow_mut().push(self.id);
        }
    }

    fn tracked(id: u32, dropped: &Rc<RefCell<Vec<u32>>>) -> Tracked {
        Tracked {
            id,
            dropped: dropped.clone(),
        }
    }

    #[test]
    fn nothing_to_poll_when_stable() {
        let mut retirement = SwapchainRetirement::<Tracked>::new();
        let released = retirement
            .poll(|_| panic!("no fence should be queried"))
            .unwrap();
        assert!(!released);
        assert!(!retirement.is_pending());
    }

    #[test]
    fn released_on_first_signaled_poll() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut retirement = SwapchainRetirement::new();
        retirement
            .retire(tracked(1, &dropped), 1, || panic!("no idle wait expected"))
            .unwrap();
        assert_eq!(retirement.pending().map(OldSwapchain::frame_index), Some(1));

        // Fence still pending: kept alive
        assert!(!retirement.poll(|slot| Ok(slot != 1)).unwrap());
        assert!(retirement.is_pending());
        assert!(dropped.borrow().is_empty());

        // Signaled: dropped on this very check
        assert!(retirement.poll(|_| Ok(true)).unwrap());
        assert!(!retirement.is_pending());
        assert_eq!(*dropped.borrow(), vec![1]);
    }

    #[test]
    fn second_replacement_waits_for_idle_once() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let idle_waits = Cell::new(0);
        let wait_idle = || -> Result<()> {
            idle_waits.set(idle_waits.get() + 1);
            Ok(())
        };

        let mut retirement = SwapchainRetirement::new();
        retirement.retire(tracked(1, &dropped), 0, wait_idle).unwrap();
        assert_eq!(idle_waits.get(), 0);

        // Fence of slot 0 has not signaled yet
        assert!(!retirement.poll(|_| Ok(false)).unwrap());

        retirement.retire(tracked(2, &dropped), 1, wait_idle).unwrap();
        assert_eq!(idle_waits.get(), 1);
        assert_eq!(retirement.forced_idle_waits(), 1);
        assert_eq!(*dropped.borrow(), vec![1]);
        assert_eq!(retirement.pending().map(|old| old.swapchain().id), Some(2));
    }

    #[test]
    fn make_room_drops_before_the_next_swapchain_exists() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut retirement = SwapchainRetirement::new();
        retirement
            .retire(tracked(1, &dropped), 0, || Ok(()))
            .unwrap();

        retirement.make_room(|| Ok(())).unwrap();
        assert!(!retirement.is_pending());
        assert_eq!(*dropped.borrow(), vec![1]);

        // Nothing parked: retiring again needs no idle wait
        retirement
            .retire(tracked(2, &dropped), 0, || panic!("device is already idle"))
            .unwrap();
        assert_eq!(retirement.forced_idle_waits(), 1);
    }

    #[test]
    fn failed_idle_wait_keeps_the_old_swapchain() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut retirement = SwapchainRetirement::new();
        retirement
            .retire(tracked(1, &dropped), 0, || Ok(()))
            .unwrap();

        let result = retirement.retire(tracked(2, &dropped), 1, || {
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        });

        assert!(result.is_err());
        // The rejected retiree is dropped, the parked one stays
        assert_eq!(*dropped.borrow(), vec![2]);
        assert_eq!(retirement.pending().map(|old| old.swapchain().id), Some(1));
    }

    #[test]
    fn poll_error_propagates() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut retirement = SwapchainRetirement::new();
        retirement
            .retire(tracked(1, &dropped), 0, || Ok(()))
            .unwrap();

        let result = retirement.poll(|_| Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert!(result.is_err());
        assert!(retirement.is_pending());
    }

    #[test]
    fn flush_releases_unconditionally() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut retirement = SwapchainRetirement::new();
        retirement
            .retire(tracked(7, &dropped), 1, || Ok(()))
            .unwrap();
        retirement.flush();
        assert_eq!(*dropped.borrow(), vec![7]);
        retirement.flush();
        assert_eq!(*dropped.borrow(), vec![7]);
    }
}
