//! Platform abstraction for the Ember engine.
//!
//! Provides window creation via winit and framebuffer size tracking,
//! including the minimized (zero-sized) state during which nothing can be
//! presented.

use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowAttributes};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Window configuration.
///
/// Resizability is a per-window setting passed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl WindowConfig {
    /// winit attributes for this configuration.
    pub fn attributes(&self) -> WindowAttributes {
        Window::default_attributes()
            .with_title(&self.title)
            .with_inner_size(PhysicalSize::new(self.width, self.height))
            .with_resizable(self.resizable)
    }

    /// Create the window on a running event loop.
    pub fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Window> {
        event_loop.create_window(self.attributes()).map_err(|e| {
            tracing::error!("Window creation failed: {e}");
            PlatformError::WindowCreation(e.to_string())
        })
    }
}

/// Create the event loop.
pub fn create_event_loop() -> Result<EventLoop<()>> {
    EventLoop::new().map_err(|e| {
        tracing::error!("Event loop creation failed: {e}");
        PlatformError::EventLoop(e.to_string())
    })
}

/// Tracks the window's framebuffer size between frames.
///
/// Resize events are coalesced: only the latest size is reported, at most
/// once, and never while the framebuffer is zero-sized. A minimized window
/// therefore holds back its resize until it is restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferTracker {
    width: u32,
    height: u32,
    resized: bool,
}

impl FramebufferTracker {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resized: false,
        }
    }

    /// Record a resize event.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        if width == 0 || height == 0 {
            tracing::debug!("Window minimized");
        }
        self.width = width;
        self.height = height;
        self.resized = true;
    }

    /// Current framebuffer size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether the framebuffer has no area.
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Latest non-zero size since the last call, if the window was resized.
    pub fn take_resize(&mut self) -> Option<(u32, u32)> {
        if !self.resized || self.is_minimized() {
            return None;
        }
        self.resized = false;
        Some((self.width, self.height))
    }
}
