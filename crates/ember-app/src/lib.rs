//! Application framework for the Ember engine.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and management
//! - GPU context initialization
//! - Swapchain creation, recreation and retirement
//! - Frame synchronization
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use ember_app::{run_app, AppConfig, AppContext, EmberApp, FrameContext};
//!
//! struct MyApp;
//!
//! impl EmberApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &AppContext, _frame: &mut FrameContext) -> anyhow::Result<()> {
//!         // Record commands that leave the image in PRESENT_SRC_KHR
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod config;
mod context;
mod frame;
mod runner;

pub use app::EmberApp;
pub use config::{AppConfig, ConfigError, MAX_FRAMES_IN_FLIGHT};
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app};

// Re-export commonly used types for convenience
pub use ember_gpu::{GpuContext, GpuContextBuilder};
pub use ember_render::Camera;
pub use winit::event::WindowEvent;
