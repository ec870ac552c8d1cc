//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use ember_gpu::{CommandPool, FrameSyncManager, GpuContext, SwapchainManager};
use ember_platform::FramebufferTracker;
use winit::window::Window;

use crate::config::AppConfig;

/// Application context shared across all app methods.
///
/// Field order is drop order: everything created from the device is
/// released before `gpu`, and the window outlives the surface.
pub struct AppContext {
    /// Swapchain and its recreation state.
    pub swapchain: SwapchainManager,
    /// Per-frame synchronization primitives.
    pub(crate) frames: FrameSyncManager,
    /// One primary command buffer per frame slot.
    pub(crate) command_buffers: Vec<vk::CommandBuffer>,
    /// Graphics-family pool; also usable for one-off uploads.
    pub command_pool: CommandPool,
    pub(crate) framebuffer: FramebufferTracker,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    /// Configuration the application was started with.
    pub config: AppConfig,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// The window handle.
    pub window: Arc<Window>,
}

impl AppContext {
    /// Create a new application context.
    pub(crate) fn new(window: Arc<Window>, gpu: GpuContext, config: AppConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        let swapchain = SwapchainManager::new(&gpu, width, height, config.vsync)?;

        let command_pool = CommandPool::resettable(gpu.device_arc().clone(), gpu.queue_families().graphics)?;
        let frames = FrameSyncManager::new(gpu.device_arc(), config.frames_in_flight)?;
        let command_buffers = command_pool
            .allocate_command_buffers(vk::CommandBufferLevel::PRIMARY, frames.frames_in_flight() as u32)?;

        tracing::info!("{} frames in flight", frames.frames_in_flight());

        Ok(Self {
            swapchain,
            frames,
            command_buffers,
            command_pool,
            framebuffer: FramebufferTracker::new(size.width, size.height),
            frame_count: 0,
            last_frame_time: Instant::now(),
            config,
            gpu,
            window,
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Color format of the swapchain images.
    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format()
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    /// Frame slot the next frame will use.
    pub fn current_frame(&self) -> usize {
        self.frames.current_frame()
    }

    /// Whether the window currently has no drawable area.
    pub fn is_minimized(&self) -> bool {
        self.framebuffer.is_minimized()
    }
}
