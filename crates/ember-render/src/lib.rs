//! Rendering building blocks for the Ember engine.
//!
//! This crate provides:
//! - Camera interface and an orbiting perspective camera
//! - Texture upload from pixels or image files
//! - Textured quad rendering with dynamic rendering

pub mod camera;
pub mod quad;
pub mod texture;

pub use camera::{Camera, CameraUniforms, Orbit, PerspectiveCamera};
pub use quad::{QuadRenderer, QuadShaders, QuadVertex};
pub use texture::{checkerboard_rgba8, Texture};
