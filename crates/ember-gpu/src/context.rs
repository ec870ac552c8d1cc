//! GPU context management.

use crate::capabilities::{DeviceRequirements, PhysicalDeviceInfo};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_devices, DeviceCandidate};
use crate::memory::GpuAllocator;
use crate::queue::QueueFamilySelection;
use crate::surface::{Surface, SurfaceSupport};
use crate::swapchain::{SwapchainDevice, SwapchainQueues};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;

/// Queue handles used by the renderer.
///
/// `graphics` and `present` are the same queue when one family does both.
#[derive(Debug, Clone, Copy)]
pub struct Queues {
    pub graphics: vk::Queue,
    pub present: vk::Queue,
}

impl Queues {
    /// Whether presentation goes through the graphics queue.
    pub fn present_is_graphics(&self) -> bool {
        self.graphics == self.present
    }
}

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface: Surface,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device_info: PhysicalDeviceInfo,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) swapchain_device: SwapchainDevice,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) queue_families: QueueFamilySelection,
    pub(crate) queues: Queues,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device, for objects that destroy themselves.
    pub fn device_arc(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Device plus swapchain loader.
    pub fn swapchain_device(&self) -> &SwapchainDevice {
        &self.swapchain_device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Snapshot of the selected physical device.
    pub fn device_info(&self) -> &PhysicalDeviceInfo {
        &self.device_info
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The window surface.
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Query current surface support for the selected device.
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        self.surface.support(self.physical_device)
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn queue_families(&self) -> &QueueFamilySelection {
        &self.queue_families
    }

    /// Queue families that share swapchain images.
    pub fn swapchain_queues(&self) -> SwapchainQueues {
        SwapchainQueues {
            graphics: self.queue_families.graphics,
            present: self.queue_families.present,
        }
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "instrument",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle().map_err(|e| {
                tracing::error!("Device wait idle failed: {e}");
                GpuError::from(e)
            })?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocator frees its VkDeviceMemory blocks, so it goes before the device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.surface.destroy();
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    requirements: DeviceRequirements,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Ember".to_string(),
            enable_validation: cfg!(debug_assertions),
            requirements: DeviceRequirements::default(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Replace the physical device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Build the GPU context for a window.
    pub fn build<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            tracing::error!("Failed to load Vulkan: {e}");
            GpuError::Loading(e.to_string())
        })?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        let instance =
            unsafe { create_instance(&entry, &self.app_name, display, self.enable_validation) }?;

        let surface = match unsafe { Surface::from_window(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let selected = unsafe { self.create_device(&instance, &surface) };
        let (candidate, queue_families, device, queues) = match selected {
            Ok(parts) => parts,
            Err(e) => {
                unsafe {
                    surface.destroy();
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        tracing::info!("Selected GPU: {}", candidate.info.summary());
        tracing::debug!(
            "Queue families: graphics={}, present={}",
            queue_families.graphics,
            queue_families.present
        );

        let device = Arc::new(device);

        let allocator = match unsafe {
            GpuAllocator::new(&instance, device.clone(), candidate.physical_device)
        } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    surface.destroy();
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let swapchain_device = SwapchainDevice::new(&instance, device.clone());

        Ok(GpuContext {
            entry,
            instance,
            surface,
            physical_device: candidate.physical_device,
            device_info: candidate.info,
            device,
            swapchain_device,
            allocator: Mutex::new(allocator),
            queue_families,
            queues,
        })
    }

    /// Pick the best device and create the logical device on it.
    ///
    /// Falls through to the next candidate if device creation fails.
    unsafe fn create_device(
        &self,
        instance: &ash::Instance,
        surface: &Surface,
    ) -> Result<(DeviceCandidate, QueueFamilySelection, ash::Device, Queues)> {
        let candidates =
            select_physical_devices(instance, &surface.loader, surface.surface, &self.requirements)?;

        let mut last_error = GpuError::NoSuitableDevice;
        for candidate in candidates {
            let Some(families) = candidate.info.queue_families_for(&self.requirements) else {
                continue;
            };

            match create_logical_device(instance, &candidate, &families, &self.requirements) {
                Ok((device, queues)) => return Ok((candidate, families, device, queues)),
                Err(e) => {
                    tracing::warn!(
                        "Device creation failed on {}: {e}",
                        candidate.info.device_name
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    candidate: &DeviceCandidate,
    families: &QueueFamilySelection,
    requirements: &DeviceRequirements,
) -> Result<(ash::Device, Queues)> {
    // One queue per unique family
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique_families()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<*const c_char> = requirements
        .extensions
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(requirements.features.dynamic_rendering)
        .synchronization2(requirements.features.synchronization2);

    // Anisotropy is used when present, not required
    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(candidate.info.features.sampler_anisotropy);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(candidate.physical_device, &device_create_info, None)
        .map_err(|e| {
            tracing::error!("Logical device creation failed: {e}");
            GpuError::from(e)
        })?;

    let queues = Queues {
        graphics: device.get_device_queue(families.graphics, 0),
        present: device.get_device_queue(families.present, 0),
    };

    Ok((device, queues))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn aliased_queues_are_detected() {
        let shared = vk::Queue::from_raw(1);
        let queues = Queues {
            graphics: shared,
            present: shared,
        };
        assert!(queues.present_is_graphics());

        let split = Queues {
            present: vk::Queue::from_raw(3),
            ..queues
        };
        assert!(!split.present_is_graphics());
    }

    #[test]
    fn builder_defaults() {
        let builder = GpuContextBuilder::new().app_name("viewer").validation(false);
        assert_eq!(builder.app_name, "viewer");
        assert!(!builder.enable_validation);
        assert_eq!(builder.requirements.api_version, vk::API_VERSION_1_3);
    }
}
