//! `EmberApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for Ember applications.
///
/// The framework owns the window, the GPU context, the swapchain and frame
/// synchronization; the application only records its commands.
pub trait EmberApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window, GPU context and swapchain exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before the swapchain image is acquired.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Render a frame.
    ///
    /// Called with the frame's command buffer already recording. The
    /// swapchain image arrives in an undefined layout and must be left in
    /// `PRESENT_SRC_KHR`. Resources indexed by `frame.frame_slot` are no
    /// longer in use by the GPU.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called with the new non-zero framebuffer size before the swapchain is
    /// rebuilt for it.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a new swapchain has been installed.
    ///
    /// The image format may differ from the previous swapchain.
    #[allow(unused_variables)]
    fn on_swapchain_recreated(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
