//! Per-frame context for rendering.

use ash::vk;

/// Context for the frame being rendered.
pub struct FrameContext {
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image for this frame.
    pub swapchain_image: vk::Image,
    pub swapchain_image_view: vk::ImageView,
    /// Swapchain extent.
    pub extent: vk::Extent2D,
    /// Frame-in-flight slot; per-frame resources are indexed by it.
    pub frame_slot: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
}
