//! Vulkan abstraction layer for the Ember engine.
//!
//! This crate provides:
//! - Vulkan instance creation and physical device selection
//! - Queue family selection and logical device management
//! - Swapchain creation, image acquisition and recreation
//! - Deferred destruction of replaced swapchains
//! - Per-frame synchronization
//! - Command buffers, shaders, pipelines, memory and descriptors

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod manager;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod retire;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{DeviceFeatures, DeviceRequirements, GpuVendor, PhysicalDeviceInfo};
pub use command::{transition_image_layout, CommandPool};
pub use context::{GpuContext, GpuContextBuilder, Queues};
pub use descriptors::{
    write_combined_image_sampler, write_uniform_buffer, DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use instance::DeviceCandidate;
pub use manager::{
    Maintenance, RecreateReason, RecreateTracker, SwapchainFactory, SwapchainLifecycle, SwapchainManager,
};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use queue::{QueueFamilyInfo, QueueFamilySelection};
pub use retire::{OldSwapchain, SwapchainRetirement};
pub use shader::{load_spirv, load_spirv_file, ShaderModule};
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::{
    get_next_image, AcquireResult, Swapchain, SwapchainConfig, SwapchainDevice, SwapchainDriver,
    SwapchainQueues, SwapchainState,
};
pub use sync::{create_fence, create_semaphore, FenceDriver, FrameSync, FrameSyncManager};
