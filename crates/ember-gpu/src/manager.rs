//! Swapchain ownership and recreation.
//!
//! [`SwapchainManager`] holds the current swapchain and drives recreation:
//! resize notifications and out-of-date/suboptimal results mark it dirty, and
//! [`SwapchainManager::check_and_recreate_if_needed`], called once per frame
//! before acquisition, rebuilds it and parks the previous one until its last
//! frame has completed.
//!
//! The sequencing lives in [`SwapchainLifecycle`], which only talks to a
//! [`SwapchainFactory`] and can be driven by a fake in tests.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::retire::SwapchainRetirement;
use crate::surface::Surface;
use crate::swapchain::{
    AcquireResult, Swapchain, SwapchainConfig, SwapchainDevice, SwapchainQueues, SwapchainState,
};
use crate::sync::{fence_signaled, FenceDriver, FrameSync, FrameSyncManager};
use ash::vk;

/// Why the swapchain has to be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    Resized,
    OutOfDate,
    Suboptimal,
    Requested,
}

/// Tracks the target window size and whether a rebuild is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecreateTracker {
    width: u32,
    height: u32,
    reason: Option<RecreateReason>,
}

impl RecreateTracker {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            reason: None,
        }
    }

    /// Record a new framebuffer size. Repeating the current size is a no-op.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.mark(RecreateReason::Resized);
        }
    }

    /// Mark the swapchain dirty. The first reason since the last rebuild wins.
    pub fn mark(&mut self, reason: RecreateReason) {
        self.reason.get_or_insert(reason);
    }

    /// Mark dirty if an acquire or present reported a degraded swapchain.
    pub fn observe(&mut self, state: SwapchainState) {
        match state {
            SwapchainState::Ok => {}
            SwapchainState::Suboptimal => self.mark(RecreateReason::Suboptimal),
            SwapchainState::OutOfDate => self.mark(RecreateReason::OutOfDate),
        }
    }

    pub fn pending(&self) -> Option<RecreateReason> {
        self.reason
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The rebuild happened.
    pub fn clear(&mut self) {
        self.reason = None;
    }
}

/// Device operations a swapchain rebuild needs.
pub trait SwapchainFactory {
    type Swapchain;

    /// Configuration for a window of the given size, from fresh surface support.
    fn derive_config(&self, width: u32, height: u32, vsync: bool) -> Result<SwapchainConfig>;

    /// Build a swapchain chained from `old`.
    fn create(&self, config: &SwapchainConfig, old: &Self::Swapchain) -> Result<Self::Swapchain>;

    /// Zero-timeout check of a frame slot's fence.
    fn frame_complete(&self, slot: usize) -> Result<bool>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<()>;
}

/// Outcome of the per-frame swapchain maintenance.
#[derive(Debug)]
pub enum Maintenance {
    /// Nothing was owed, or the rebuild is postponed.
    Unchanged,
    /// A new swapchain is installed.
    Recreated,
    /// The rebuild failed. The previous swapchain is still current and the
    /// rebuild stays owed.
    RebuildFailed(GpuError),
}

/// Current swapchain, the retired one and the pending rebuild.
pub struct SwapchainLifecycle<S> {
    // Dropped in declaration order: the retiree before the current swapchain
    retirement: SwapchainRetirement<S>,
    current: S,
    tracker: RecreateTracker,
    vsync: bool,
    generation: u64,
}

impl<S> SwapchainLifecycle<S> {
    pub fn new(current: S, width: u32, height: u32, vsync: bool) -> Self {
        Self {
            retirement: SwapchainRetirement::new(),
            current,
            tracker: RecreateTracker::new(width, height),
            vsync,
            generation: 0,
        }
    }

    pub fn current(&self) -> &S {
        &self.current
    }

    pub fn retirement(&self) -> &SwapchainRetirement<S> {
        &self.retirement
    }

    pub fn tracker(&self) -> &RecreateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut RecreateTracker {
        &mut self.tracker
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    /// Change the present mode preference; takes effect on the next rebuild.
    pub fn set_vsync(&mut self, vsync: bool) {
        if self.vsync != vsync {
            self.vsync = vsync;
            self.tracker.mark(RecreateReason::Requested);
        }
    }

    /// Incremented on every successful recreation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release the retired swapchain if its frame has completed.
    ///
    /// A failed fence poll means the device is gone, so the error is final.
    pub fn poll_retirement<F>(&mut self, factory: &F) -> Result<bool>
    where
        F: SwapchainFactory<Swapchain = S>,
    {
        self.retirement.poll(|slot| factory.frame_complete(slot))
    }

    /// Per-frame maintenance: poll the retiree, then rebuild if owed.
    ///
    /// The replaced swapchain is parked under `retire_slot`. Failures to
    /// query the surface or build the swapchain come back as
    /// [`Maintenance::RebuildFailed`]; an `Err` is not recoverable.
    pub fn check_and_recreate<F>(&mut self, factory: &F, retire_slot: usize) -> Result<Maintenance>
    where
        F: SwapchainFactory<Swapchain = S>,
    {
        self.poll_retirement(factory)?;

        let Some(reason) = self.tracker.pending() else {
            return Ok(Maintenance::Unchanged);
        };

        let (width, height) = self.tracker.size();
        let config = match factory.derive_config(width, height, self.vsync) {
            Ok(config) => config,
            Err(e) => return Ok(Maintenance::RebuildFailed(e)),
        };
        if config.is_zero_sized() {
            tracing::debug!("Swapchain rebuild postponed, surface extent is zero");
            return Ok(Maintenance::Unchanged);
        }

        tracing::debug!("Recreating swapchain ({reason:?})");

        // A second replacement must not coexist with an unretired one
        self.retirement.make_room(|| factory.wait_idle())?;

        let replacement = match factory.create(&config, &self.current) {
            Ok(swapchain) => swapchain,
            Err(e) => return Ok(Maintenance::RebuildFailed(e)),
        };

        let old = std::mem::replace(&mut self.current, replacement);
        self.retirement.retire(old, retire_slot, || factory.wait_idle())?;

        self.tracker.clear();
        self.generation += 1;
        Ok(Maintenance::Recreated)
    }

    /// Destroy the retired swapchain now.
    ///
    /// The device must be idle.
    pub fn release_retired(&mut self) {
        self.retirement.flush();
    }
}

/// Owner of the current swapchain and of the one being retired.
pub struct SwapchainManager {
    lifecycle: SwapchainLifecycle<Swapchain>,
    device: SwapchainDevice,
    physical_device: vk::PhysicalDevice,
    queues: SwapchainQueues,
    transfer_dst: bool,
}

impl SwapchainManager {
    /// Create the initial swapchain for a context.
    pub fn new(context: &GpuContext, width: u32, height: u32, vsync: bool) -> Result<Self> {
        Self::with_options(context, width, height, vsync, false)
    }

    /// Like [`Self::new`], optionally allowing transfer writes into images.
    pub fn with_options(
        context: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        transfer_dst: bool,
    ) -> Result<Self> {
        let device = context.swapchain_device().clone();
        let physical_device = context.physical_device();
        let queues = context.swapchain_queues();

        let config = derive_config(context.surface(), physical_device, width, height, vsync, transfer_dst)?;
        if config.is_zero_sized() {
            tracing::error!("Cannot create a swapchain for a zero-sized surface");
            return Err(GpuError::SwapchainCreation(
                "Surface extent is zero".to_string(),
            ));
        }

        let swapchain = Swapchain::new(&device, &config, physical_device, context.surface(), queues, None)?;

        tracing::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            config.extent.width,
            config.extent.height,
            swapchain.image_count(),
            config.format.format,
            config.present_mode
        );

        Ok(Self {
            lifecycle: SwapchainLifecycle::new(swapchain, width, height, vsync),
            device,
            physical_device,
            queues,
            transfer_dst,
        })
    }

    /// Configuration of the current swapchain.
    pub fn config(&self) -> &SwapchainConfig {
        self.swapchain().config()
    }

    pub fn swapchain(&self) -> &Swapchain {
        self.lifecycle.current()
    }

    /// Raw handle of the current swapchain.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain().handle()
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.swapchain().image(index)
    }

    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.swapchain().image_view(index)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain().extent()
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain().format()
    }

    /// Incremented on every successful recreation.
    pub fn generation(&self) -> u64 {
        self.lifecycle.generation()
    }

    /// Whether a replaced swapchain is still waiting to be destroyed.
    pub fn has_retiring_swapchain(&self) -> bool {
        self.lifecycle.retirement().is_pending()
    }

    /// Pending rebuild, if any.
    pub fn pending_recreate(&self) -> Option<RecreateReason> {
        self.lifecycle.tracker().pending()
    }

    pub fn vsync(&self) -> bool {
        self.lifecycle.vsync()
    }

    /// Change the present mode preference; takes effect on the next rebuild.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.lifecycle.set_vsync(vsync);
    }

    /// Report the latest framebuffer size.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.lifecycle.tracker_mut().resize(width, height);
    }

    /// Ask for a rebuild before the next frame.
    pub fn request_recreate(&mut self) {
        self.lifecycle.tracker_mut().mark(RecreateReason::Requested);
    }

    /// Acquire the next image for a frame slot.
    ///
    /// Out-of-date and suboptimal results schedule a rebuild; the caller
    /// must skip the frame on out-of-date.
    pub fn next_image(&mut self, sync: &FrameSync) -> Result<AcquireResult> {
        let acquired = self
            .swapchain()
            .next_image(sync.drawing, sync.image_acquired)?;
        self.lifecycle.tracker_mut().observe(acquired.state);
        Ok(acquired)
    }

    /// Present an image of the current swapchain.
    ///
    /// # Safety
    /// `queue` must be able to present to the surface and the semaphores
    /// must be valid.
    pub unsafe fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SwapchainState> {
        let state = self.swapchain().present(queue, image_index, wait_semaphores)?;
        self.lifecycle.tracker_mut().observe(state);
        Ok(state)
    }

    /// Per-frame maintenance, called before acquiring.
    ///
    /// Releases the retired swapchain once its frame fence has signaled, then
    /// rebuilds the swapchain if one is owed. A zero-sized surface postpones
    /// the rebuild. An `Err` means the device can no longer be used.
    pub fn check_and_recreate_if_needed(
        &mut self,
        surface: &Surface,
        frames: &FrameSyncManager,
    ) -> Result<Maintenance> {
        let factory = DeviceFactory {
            device: &self.device,
            physical_device: self.physical_device,
            surface,
            queues: self.queues,
            transfer_dst: self.transfer_dst,
            frames,
        };

        let outcome = self
            .lifecycle
            .check_and_recreate(&factory, frames.previous_frame())
            .inspect_err(|e| tracing::error!("Swapchain maintenance failed: {e}"))?;

        if let Maintenance::Recreated = outcome {
            let swapchain = self.lifecycle.current();
            tracing::info!(
                "Swapchain recreated: {}x{}, {} images",
                swapchain.extent().width,
                swapchain.extent().height,
                swapchain.image_count()
            );
        }

        Ok(outcome)
    }

    /// Destroy the retired swapchain now.
    ///
    /// The device must be idle.
    pub fn release_retired(&mut self) {
        self.lifecycle.release_retired();
    }
}

/// Rebuilds against the real device and surface.
struct DeviceFactory<'a> {
    device: &'a SwapchainDevice,
    physical_device: vk::PhysicalDevice,
    surface: &'a Surface,
    queues: SwapchainQueues,
    transfer_dst: bool,
    frames: &'a FrameSyncManager,
}

impl SwapchainFactory for DeviceFactory<'_> {
    type Swapchain = Swapchain;

    fn derive_config(&self, width: u32, height: u32, vsync: bool) -> Result<SwapchainConfig> {
        derive_config(self.surface, self.physical_device, width, height, vsync, self.transfer_dst)
    }

    fn create(&self, config: &SwapchainConfig, old: &Swapchain) -> Result<Swapchain> {
        Swapchain::new(
            self.device,
            config,
            self.physical_device,
            self.surface,
            self.queues,
            Some(old.handle()),
        )
    }

    fn frame_complete(&self, slot: usize) -> Result<bool> {
        let fence = self.frames.fence(slot).ok_or_else(|| {
            tracing::error!("Retired swapchain refers to unknown frame slot {slot}");
            GpuError::InvalidState(format!("Unknown frame slot {slot}"))
        })?;
        fence_signaled(self.device, fence)
    }

    fn wait_idle(&self) -> Result<()> {
        FenceDriver::wait_idle(self.device).map_err(|e| {
            tracing::error!("Device wait idle failed: {e}");
            GpuError::from(e)
        })
    }
}

fn derive_config(
    surface: &Surface,
    physical_device: vk::PhysicalDevice,
    width: u32,
    height: u32,
    vsync: bool,
    transfer_dst: bool,
) -> Result<SwapchainConfig> {
    let support = surface.support(physical_device)?;
    let config = SwapchainConfig::derive(&support, width, height, vsync)?;
    Ok(if transfer_dst {
        config.with_transfer_dst()
    } else {
        config
    })
}
