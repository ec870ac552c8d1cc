//! Vulkan instance creation and physical device selection.

use crate::capabilities::{DeviceRequirements, PhysicalDeviceInfo};
use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

const ENGINE_NAME: &CStr = c"Ember";

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance extensions needed on top of the window-system ones.
fn platform_instance_extensions() -> Vec<*const c_char> {
    #[allow(unused_mut)]
    let mut extensions = Vec::new();
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    extensions
}

/// Create a Vulkan instance able to present to windows on `display`.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    // Surface extensions for this platform
    let extension_names: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))?
        .iter()
        .copied()
        .chain(platform_instance_extensions())
        .collect();

    let layers = if enable_validation {
        available_validation_layers(entry)?
    } else {
        Vec::new()
    };
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None).map_err(|e| {
        tracing::error!("Instance creation failed: {e}");
        GpuError::from(e)
    })?;

    Ok(instance)
}

/// Requested validation layers that the loader actually provides.
unsafe fn available_validation_layers(entry: &ash::Entry) -> Result<Vec<&'static CStr>> {
    let available = entry.enumerate_instance_layer_properties()?;

    let layers = validation_layers()
        .into_iter()
        .filter(|layer| {
            let found = available
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();

    Ok(layers)
}

/// A physical device that passed the requirement checks.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub info: PhysicalDeviceInfo,
    pub score: u32,
}

/// Filter devices against `requirements` and sort survivors best first.
///
/// Devices with equal scores keep their enumeration order.
pub fn rank_devices(
    devices: Vec<(vk::PhysicalDevice, PhysicalDeviceInfo)>,
    requirements: &DeviceRequirements,
) -> Vec<DeviceCandidate> {
    let mut candidates: Vec<DeviceCandidate> = devices
        .into_iter()
        .filter_map(|(physical_device, info)| {
            let score = info.evaluate(requirements)?;
            Some(DeviceCandidate {
                physical_device,
                info,
                score,
            })
        })
        .collect();

    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    candidates
}

/// Enumerate, filter and score physical devices for a surface.
///
/// # Safety
/// The instance and surface must be valid.
pub unsafe fn select_physical_devices(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    requirements: &DeviceRequirements,
) -> Result<Vec<DeviceCandidate>> {
    let devices = instance.enumerate_physical_devices()?;

    let infos = devices
        .into_iter()
        .map(|device| {
            let info = PhysicalDeviceInfo::query(instance, surface_loader, surface, device);
            tracing::debug!("Found GPU: {}", info.summary());
            (device, info)
        })
        .collect();

    let candidates = rank_devices(infos, requirements);
    if candidates.is_empty() {
        tracing::error!("No physical device satisfies the renderer requirements");
        return Err(GpuError::NoSuitableDevice);
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{DeviceFeatures, GpuVendor};
    use crate::queue::QueueFamilyInfo;
    use ash::vk::Handle;

    fn info(name: &str, device_type: vk::PhysicalDeviceType, vram_mb: u64) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            vendor: GpuVendor::Other(0),
            device_name: name.to_string(),
            device_type,
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
            features: DeviceFeatures {
                sampler_anisotropy: true,
                dynamic_rendering: true,
                synchronization2: true,
            },
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 1,
            }],
            present_families: vec![0],
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            device_local_memory_mb: vram_mb,
            max_sampler_anisotropy: 16.0,
        }
    }

    #[test]
    fn ranking_sorts_and_filters() {
        let mut broken = info("broken", vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        broken.extensions.clear();

        let devices = vec![
            (
                vk::PhysicalDevice::from_raw(1),
                info("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 2048),
            ),
            (vk::PhysicalDevice::from_raw(2), broken),
            (
                vk::PhysicalDevice::from_raw(3),
                info("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            ),
        ];

        let ranked = rank_devices(devices, &DeviceRequirements::default());

        let names: Vec<_> = ranked.iter().map(|c| c.info.device_name.as_str()).collect();
        assert_eq!(names, vec!["dgpu", "igpu"]);
        assert_eq!(ranked[0].physical_device.as_raw(), 3);
    }

    #[test]
    fn more_memory_breaks_type_ties() {
        let devices = vec![
            (
                vk::PhysicalDevice::from_raw(1),
                info("small", vk::PhysicalDeviceType::DISCRETE_GPU, 2048),
            ),
            (
                vk::PhysicalDevice::from_raw(2),
                info("large", vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            ),
        ];

        let ranked = rank_devices(devices, &DeviceRequirements::default());
        assert_eq!(ranked[0].info.device_name, "large");
    }
}
