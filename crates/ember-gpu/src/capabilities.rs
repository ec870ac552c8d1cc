//! GPU capability detection and physical device requirements.

use crate::queue::{find_queue_families, QueueFamilyInfo, QueueFamilySelection};
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Optional device features the renderer cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
}

impl DeviceFeatures {
    /// Names of the features in `required` that `self` lacks.
    pub fn missing(&self, required: &Self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if required.sampler_anisotropy && !self.sampler_anisotropy {
            missing.push("samplerAnisotropy");
        }
        if required.dynamic_rendering && !self.dynamic_rendering {
            missing.push("dynamicRendering");
        }
        if required.synchronization2 && !self.synchronization2 {
            missing.push("synchronization2");
        }
        missing
    }
}

/// What a physical device must offer to be considered at all.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Minimum Vulkan API version.
    pub api_version: u32,
    /// Device extensions that must be present (and will be enabled).
    pub extensions: Vec<&'static CStr>,
    /// Features that must be supported (and will be enabled).
    pub features: DeviceFeatures,
    /// Flags the graphics queue family must carry besides `GRAPHICS`.
    pub queue_flags: vk::QueueFlags,
    /// Each entry must be satisfied by at least one memory type.
    pub memory_properties: Vec<vk::MemoryPropertyFlags>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            api_version: vk::API_VERSION_1_3,
            extensions: vec![ash::khr::swapchain::NAME],
            features: DeviceFeatures {
                sampler_anisotropy: false,
                dynamic_rendering: true,
                synchronization2: true,
            },
            queue_flags: vk::QueueFlags::empty(),
            memory_properties: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
        }
    }
}

/// Snapshot of everything the selector needs to know about one adapter.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    pub extensions: HashSet<String>,
    pub features: DeviceFeatures,
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Families able to present to the target surface.
    pub present_families: Vec<u32>,
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub device_local_memory_mb: u64,
    pub max_sampler_anisotropy: f32,
}

impl PhysicalDeviceInfo {
    /// Query a physical device.
    ///
    /// # Safety
    /// The instance, physical device and surface must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let features = query_features(instance, physical_device, properties.api_version);

        let queue_families = QueueFamilyInfo::from_properties(
            &instance.get_physical_device_queue_family_properties(physical_device),
        );

        let present_families = queue_families
            .iter()
            .filter(|family| {
                surface_loader
                    .get_physical_device_surface_support(physical_device, family.index, surface)
                    .unwrap_or(false)
            })
            .map(|family| family.index)
            .collect();

        let memory_types = memory_properties.memory_types
            [..memory_properties.memory_type_count as usize]
            .iter()
            .map(|ty| ty.property_flags)
            .collect();

        let device_local_memory_mb: u64 = memory_properties.memory_heaps
            [..memory_properties.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            extensions,
            features,
            queue_families,
            present_families,
            memory_types,
            device_local_memory_mb,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
        }
    }

    /// Queue families satisfying `requirements`, if any.
    pub fn queue_families_for(
        &self,
        requirements: &DeviceRequirements,
    ) -> Option<QueueFamilySelection> {
        find_queue_families(&self.queue_families, requirements.queue_flags, |index| {
            self.present_families.contains(&index)
        })
    }

    /// Check requirements and score the device.
    ///
    /// Returns `None` if the device cannot be used, otherwise a score where
    /// higher is better.
    pub fn evaluate(&self, requirements: &DeviceRequirements) -> Option<u32> {
        if !version_at_least(self.api_version, requirements.api_version) {
            tracing::debug!("{}: API version too old", self.device_name);
            return None;
        }

        if let Some(ext) = requirements
            .extensions
            .iter()
            .filter_map(|ext| ext.to_str().ok())
            .find(|ext| !self.extensions.contains(*ext))
        {
            tracing::debug!("{}: missing extension {}", self.device_name, ext);
            return None;
        }

        let missing = self.features.missing(&requirements.features);
        if !missing.is_empty() {
            tracing::debug!("{}: missing features {:?}", self.device_name, missing);
            return None;
        }

        self.queue_families_for(requirements)?;

        let memory_ok = requirements
            .memory_properties
            .iter()
            .all(|wanted| self.memory_types.iter().any(|ty| ty.contains(*wanted)));
        if !memory_ok {
            tracing::debug!("{}: missing memory type", self.device_name);
            return None;
        }

        let mut score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            vk::PhysicalDeviceType::CPU => 10,
            _ => 0,
        };

        // +1 per GB
        score += (self.device_local_memory_mb / 1024) as u32;

        Some(score)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Compare packed Vulkan versions, ignoring the variant and patch fields.
pub fn version_at_least(version: u32, required: u32) -> bool {
    let have = (vk::api_version_major(version), vk::api_version_minor(version));
    let want = (vk::api_version_major(required), vk::api_version_minor(required));
    have >= want
}

unsafe fn query_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    api_version: u32,
) -> DeviceFeatures {
    // 1.3 structs may only be chained on devices that know them
    if !version_at_least(api_version, vk::API_VERSION_1_3) {
        let base = instance.get_physical_device_features(physical_device);
        return DeviceFeatures {
            sampler_anisotropy: base.sampler_anisotropy == vk::TRUE,
            ..DeviceFeatures::default()
        };
    }

    let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3);
    instance.get_physical_device_features2(physical_device, &mut features2);
    let sampler_anisotropy = features2.features.sampler_anisotropy == vk::TRUE;

    DeviceFeatures {
        sampler_anisotropy,
        dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
        synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suitable_device(name: &str, device_type: vk::PhysicalDeviceType) -> PhysicalDeviceInfo {
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
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                queue_count: 1,
            }],
            present_families: vec![0],
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            device_local_memory_mb: 4096,
            max_sampler_anisotropy: 16.0,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn discrete_outscores_integrated() {
        let requirements = DeviceRequirements::default();
        let discrete = suitable_device("d", vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = suitable_device("i", vk::PhysicalDeviceType::INTEGRATED_GPU);

        assert_eq!(discrete.evaluate(&requirements), Some(1004));
        assert_eq!(integrated.evaluate(&requirements), Some(104));
    }

    #[test]
    fn rejects_old_api_version() {
        let mut device = suitable_device("old", vk::PhysicalDeviceType::DISCRETE_GPU);
        device.api_version = vk::API_VERSION_1_2;
        assert_eq!(device.evaluate(&DeviceRequirements::default()), None);
    }

    #[test]
    fn rejects_missing_extension() {
        let mut device = suitable_device("noswap", vk::PhysicalDeviceType::DISCRETE_GPU);
        device.extensions.clear();
        assert_eq!(device.evaluate(&DeviceRequirements::default()), None);
    }

    #[test]
    fn rejects_missing_feature() {
        let mut device = suitable_device("nofeat", vk::PhysicalDeviceType::DISCRETE_GPU);
        device.features.dynamic_rendering = false;
        assert_eq!(device.evaluate(&DeviceRequirements::default()), None);
        assert_eq!(
            device.features.missing(&DeviceRequirements::default().features),
            vec!["dynamicRendering"]
        );
    }

    #[test]
    fn rejects_device_without_present_queue() {
        let mut device = suitable_device("headless", vk::PhysicalDeviceType::DISCRETE_GPU);
        device.present_families.clear();
        assert_eq!(device.evaluate(&DeviceRequirements::default()), None);
    }

    #[test]
    fn rejects_missing_memory_type() {
        let mut device = suitable_device("nohost", vk::PhysicalDeviceType::DISCRETE_GPU);
        device.memory_types = vec![vk::MemoryPropertyFlags::DEVICE_LOCAL];
        assert_eq!(device.evaluate(&DeviceRequirements::default()), None);
    }

    #[test]
    fn version_comparison_ignores_patch() {
        assert!(version_at_least(
            vk::make_api_version(0, 1, 3, 0),
            vk::make_api_version(0, 1, 3, 200)
        ));
        assert!(version_at_least(vk::API_VERSION_1_3, vk::API_VERSION_1_1));
        assert!(!version_at_least(vk::API_VERSION_1_1, vk::API_VERSION_1_3));
    }
}
