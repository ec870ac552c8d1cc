//! Swapchain management.
//!
//! A [`Swapchain`] owns the native swapchain and one image view per
//! presentable image. Images themselves belong to the driver. Acquisition is
//! split into [`get_next_image`], which only talks to a [`SwapchainDriver`],
//! so the fence/acquire ordering can be tested against a fake driver.

use crate::error::{GpuError, Result};
use crate::surface::{calculate_extent, select_present_mode, select_surface_format, Surface, SurfaceSupport};
use crate::sync::{wait_for_fence, FenceDriver, INFINITE_TIMEOUT};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Health of the swapchain as reported by acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    /// Matches the surface exactly.
    Ok,
    /// Still usable for this frame, but should be recreated soon.
    Suboptimal,
    /// No longer compatible with the surface; must be recreated.
    OutOfDate,
}

impl SwapchainState {
    /// Whether the swapchain should be rebuilt.
    pub fn needs_recreate(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// Outcome of an image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireResult {
    pub index: u32,
    pub state: SwapchainState,
}

/// Immutable swapchain parameters, derived once per (re)creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Smallest image count the surface accepts.
    pub min_image_count: u32,
    /// Image count requested from the driver.
    pub image_count: u32,
    pub usage: vk::ImageUsageFlags,
}

impl SwapchainConfig {
    /// Derive a configuration from freshly queried surface support.
    ///
    /// Requests one image more than the minimum, clamped to the surface
    /// maximum when it has one.
    pub fn derive(support: &SurfaceSupport, width: u32, height: u32, vsync: bool) -> Result<Self> {
        let caps = &support.capabilities;

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        Ok(Self {
            format: select_surface_format(&support.formats)?,
            present_mode: select_present_mode(&support.present_modes, vsync),
            extent: calculate_extent(caps, width, height),
            min_image_count: caps.min_image_count,
            image_count,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        })
    }

    /// Also allow the images to be written by transfer commands.
    pub fn with_transfer_dst(mut self) -> Self {
        self.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        self
    }

    /// A zero-sized extent cannot back a swapchain (minimized window).
    pub fn is_zero_sized(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// Queue families that touch swapchain images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainQueues {
    pub graphics: u32,
    pub present: u32,
}

impl SwapchainQueues {
    /// Sharing mode and the family list to hand to the driver.
    ///
    /// Exclusive with no families when one family does both jobs, otherwise
    /// concurrent between exactly the two families.
    pub fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        if self.graphics == self.present {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (
                vk::SharingMode::CONCURRENT,
                vec![self.graphics, self.present],
            )
        }
    }
}

/// Swapchain operations needed to acquire images.
pub trait SwapchainDriver: FenceDriver {
    /// Raw acquire: the native result code and the image index it produced.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> (vk::Result, u32);
}

/// Device and swapchain loader shared by every swapchain of a device.
#[derive(Clone)]
pub struct SwapchainDevice {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
}

impl SwapchainDevice {
    pub fn new(instance: &ash::Instance, device: Arc<ash::Device>) -> Self {
        let loader = ash::khr::swapchain::Device::new(instance, &device);
        Self { device, loader }
    }

    /// The logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The swapchain extension loader.
    pub fn loader(&self) -> &ash::khr::swapchain::Device {
        &self.loader
    }
}

impl FenceDriver for SwapchainDevice {
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        self.device.wait_for_fence(fence, timeout_ns)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        FenceDriver::reset_fence(&*self.device, fence)
    }

    fn wait_idle(&self) -> VkResult<()> {
        FenceDriver::wait_idle(&*self.device)
    }
}

impl SwapchainDriver for SwapchainDevice {
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> (vk::Result, u32) {
        // The raw entry point keeps the index on SUBOPTIMAL/OUT_OF_DATE
        let mut index = 0;
        let code = unsafe {
            (self.loader.fp().acquire_next_image_khr)(
                self.loader.device(),
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
                &mut index,
            )
        };
        (code, index)
    }
}

/// Map a native acquire result to an [`AcquireResult`].
pub fn classify_acquire(code: vk::Result, index: u32) -> Result<AcquireResult> {
    let state = match code {
        vk::Result::SUCCESS => SwapchainState::Ok,
        vk::Result::SUBOPTIMAL_KHR => {
            tracing::warn!("Swapchain suboptimal on acquire (image {index})");
            SwapchainState::Suboptimal
        }
        vk::Result::ERROR_OUT_OF_DATE_KHR => {
            tracing::warn!("Swapchain out of date on acquire");
            SwapchainState::OutOfDate
        }
        other => {
            tracing::error!("Image acquisition failed: {other}");
            return Err(GpuError::AcquireFailed(other.to_string()));
        }
    };

    Ok(AcquireResult { index, state })
}

/// Map a native present result to a [`SwapchainState`].
pub fn classify_present(result: VkResult<bool>) -> Result<SwapchainState> {
    match result {
        Ok(false) => Ok(SwapchainState::Ok),
        Ok(true) => {
            tracing::warn!("Swapchain suboptimal on present");
            Ok(SwapchainState::Suboptimal)
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            tracing::warn!("Swapchain out of date on present");
            Ok(SwapchainState::OutOfDate)
        }
        Err(e) => {
            tracing::error!("Present failed: {e}");
            Err(GpuError::PresentFailed(e.to_string()))
        }
    }
}

/// Acquire the next image for a frame slot.
///
/// Waits for the slot's previous submission (`wait_fence`), acquires an
/// image that signals `signal_semaphore`, and resets `wait_fence` once the
/// slot is about to be reused. The fence is left signaled when no image was
/// acquired (out of date or error), because nothing will be submitted that
/// could signal it again.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn get_next_image<D: SwapchainDriver + ?Sized>(
    driver: &D,
    swapchain: vk::SwapchainKHR,
    wait_fence: vk::Fence,
    signal_semaphore: vk::Semaphore,
) -> Result<AcquireResult> {
    wait_for_fence(driver, wait_fence)?;

    let (code, index) = driver.acquire_next_image(swapchain, INFINITE_TIMEOUT, signal_semaphore);
    let acquired = classify_acquire(code, index)?;

    if acquired.state != SwapchainState::OutOfDate {
        driver.reset_fence(wait_fence).map_err(|e| {
            tracing::error!("Fence reset failed: {e}");
            GpuError::from(e)
        })?;
    }

    Ok(acquired)
}

/// Create one view per image, all or nothing.
///
/// An empty image list is a driver contract violation. If any view fails,
/// the views created so far are handed to `destroy` before returning.
pub fn build_image_views<C, D>(images: &[vk::Image], mut create: C, mut destroy: D) -> Result<Vec<vk::ImageView>>
where
    C: FnMut(vk::Image) -> VkResult<vk::ImageView>,
    D: FnMut(vk::ImageView),
{
    if images.is_empty() {
        tracing::error!("Driver returned a swapchain without images");
        return Err(GpuError::SwapchainCreation(
            "Swapchain has no images".to_string(),
        ));
    }

    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        match create(image) {
            Ok(view) => views.push(view),
            Err(e) => {
                tracing::error!("Image view creation failed: {e}");
                views.into_iter().for_each(&mut destroy);
                return Err(GpuError::ImageViewCreation(e.to_string()));
            }
        }
    }

    Ok(views)
}

/// Whether the driver created exactly the requested number of images.
pub fn image_count_met(created: usize, requested: u32) -> bool {
    usize::try_from(requested).is_ok_and(|requested| requested == created)
}

/// Pick a supported composite alpha mode, opaque if possible.
pub fn select_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|mode| supported.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Swapchain wrapper. Destroys its views and the native swapchain on drop.
pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    config: SwapchainConfig,
    device: SwapchainDevice,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// `old_swapchain` chains the new swapchain from the one it replaces so
    /// the driver can reuse its resources; the old one stays valid and must
    /// be dropped separately once the GPU is done with it.
    pub fn new(
        device: &SwapchainDevice,
        config: &SwapchainConfig,
        physical_device: vk::PhysicalDevice,
        surface: &Surface,
        queues: SwapchainQueues,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        // Transform and alpha come from the live surface; extent comes from `config`
        let capabilities = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(physical_device, surface.surface)
        }
        .map_err(|e| {
            tracing::error!("Surface capability query failed: {e}");
            GpuError::SwapchainCreation(e.to_string())
        })?;

        let (sharing_mode, queue_families) = queues.sharing();

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(config.image_count)
            .image_format(config.format.format)
            .image_color_space(config.format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(config.usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(select_composite_alpha(capabilities.supported_composite_alpha))
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let loader = device.loader();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|e| {
            tracing::error!("Swapchain creation failed: {e}");
            GpuError::SwapchainCreation(e.to_string())
        })?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                tracing::error!("Swapchain image query failed: {e}");
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(GpuError::SwapchainCreation(e.to_string()));
            }
        };

        let raw = device.device();
        let views = build_image_views(
            &images,
            |image| unsafe { create_color_view(raw, image, config.format.format) },
            |view| unsafe { raw.destroy_image_view(view, None) },
        );
        let image_views = match views {
            Ok(views) => views,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        if !image_count_met(images.len(), config.image_count) {
            tracing::debug!(
                "Driver created {} images (requested {})",
                images.len(),
                config.image_count
            );
        }

        Ok(Self {
            swapchain,
            images,
            image_views,
            config: *config,
            device: device.clone(),
        })
    }

    /// Raw handle, for present calls and chaining.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Configuration the swapchain was built from.
    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn format(&self) -> vk::Format {
        self.config.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    /// Presentable images, in driver order.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// One view per image, same order as [`Self::images`].
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.image_views.get(index as usize).copied()
    }

    /// Number of presentable images actually created.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image for the frame slot guarded by `wait_fence`.
    pub fn next_image(&self, wait_fence: vk::Fence, signal_semaphore: vk::Semaphore) -> Result<AcquireResult> {
        get_next_image(&self.device, self.swapchain, wait_fence, signal_semaphore)
    }

    /// Present an image.
    ///
    /// # Safety
    /// `queue` must be able to present to the surface and the semaphores
    /// must be valid.
    #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SwapchainState> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        classify_present(self.device.loader().queue_present(queue, &present_info))
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        tracing::debug!("Destroying swapchain {:?}", self.swapchain);
        unsafe {
            for &view in &self.image_views {
                self.device.device().destroy_image_view(view, None);
            }
            self.device.loader().destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Create a 2D color view covering one mip level and one layer.
unsafe fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> VkResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    device.create_image_view(&view_info, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    fn support(min: u32, max: u32) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: min,
                max_image_count: max,
                current_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn config_requests_one_extra_image() {
        let config = SwapchainConfig::derive(&support(2, 0), 1024, 768, false).unwrap();

        assert_eq!(config.format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(config.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.extent.width, 800);
        assert_eq!(config.extent.height, 600);
        assert_eq!(config.min_image_count, 2);
        assert_eq!(config.image_count, 3);
        assert!(!config.is_zero_sized());
    }

    #[test]
    fn config_clamps_to_max_images() {
        let config = SwapchainConfig::derive(&support(2, 2), 800, 600, true).unwrap();
        assert_eq!(config.image_count, 2);
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn config_detects_minimized_surface() {
        let mut minimized = support(2, 3);
        minimized.capabilities.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        let config = SwapchainConfig::derive(&minimized, 0, 0, false).unwrap();
        assert!(config.is_zero_sized());
    }

    #[test]
    fn transfer_dst_usage_is_additive() {
        let config = SwapchainConfig::derive(&support(2, 3), 800, 600, false)
            .unwrap()
            .with_transfer_dst();
        assert!(config.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(config.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn same_family_uses_exclusive_sharing() {
        let (mode, families) = SwapchainQueues {
            graphics: 0,
            present: 0,
        }
        .sharing();
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(families.is_empty());
    }

    #[test]
    fn distinct_families_use_concurrent_sharing() {
        let (mode, families) = SwapchainQueues {
            graphics: 0,
            present: 2,
        }
        .sharing();
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(families, vec![0, 2]);
    }

    #[test]
    fn acquire_codes_are_classified() {
        assert_eq!(
            classify_acquire(vk::Result::SUCCESS, 0).unwrap(),
            AcquireResult {
                index: 0,
                state: SwapchainState::Ok
            }
        );
        assert_eq!(
            classify_acquire(vk::Result::SUBOPTIMAL_KHR, 2).unwrap().state,
            SwapchainState::Suboptimal
        );
        assert_eq!(
            classify_acquire(vk::Result::ERROR_OUT_OF_DATE_KHR, 1).unwrap(),
            AcquireResult {
                index: 1,
                state: SwapchainState::OutOfDate
            }
        );

        for code in [
            vk::Result::TIMEOUT,
            vk::Result::NOT_READY,
            vk::Result::ERROR_DEVICE_LOST,
            vk::Result::ERROR_SURFACE_LOST_KHR,
        ] {
            assert!(
                matches!(classify_acquire(code, 0), Err(GpuError::AcquireFailed(_))),
                "{code:?} must be an error"
            );
        }
    }

    #[test]
    fn present_codes_are_classified() {
        assert_eq!(classify_present(Ok(false)).unwrap(), SwapchainState::Ok);
        assert_eq!(
            classify_present(Ok(true)).unwrap(),
            SwapchainState::Suboptimal
        );
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            SwapchainState::OutOfDate
        );
        assert!(matches!(
            classify_present(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GpuError::PresentFailed(_))
        ));
    }

    #[test]
    fn views_match_images() {
        let images: Vec<_> = (1..=3).map(vk::Image::from_raw).collect();
        let views = build_image_views(
            &images,
            |image| Ok(vk::ImageView::from_raw(image.as_raw() + 100)),
            |_| panic!("nothing to destroy"),
        )
        .unwrap();

        assert_eq!(views.len(), images.len());
        assert_eq!(views[2].as_raw(), 103);
    }

    #[test]
    fn empty_image_list_is_an_error() {
        let result = build_image_views(&[], |_| unreachable!(), |_| unreachable!());
        assert!(matches!(result, Err(GpuError::SwapchainCreation(_))));
    }

    #[test]
    fn failed_view_destroys_partial_views() {
        let images: Vec<_> = (1..=3).map(vk::Image::from_raw).collect();
        let mut destroyed = Vec::new();

        let result = build_image_views(
            &images,
            |image| {
                if image.as_raw() == 3 {
                    Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                } else {
                    Ok(vk::ImageView::from_raw(image.as_raw() + 100))
                }
            },
            |view| destroyed.push(view.as_raw()),
        );

        assert!(matches!(result, Err(GpuError::ImageViewCreation(_))));
        assert_eq!(destroyed, vec![101, 102]);
    }

    #[test]
    fn image_count_compares_without_truncation() {
        assert!(image_count_met(3, 3));
        assert!(!image_count_met(4, 3));

        // Would wrap to 3 if narrowed to u32
        #[cfg(target_pointer_width = "64")]
        assert!(!image_count_met((1usize << 32) + 3, 3));
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        assert_eq!(
            select_composite_alpha(
                vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT
            ),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        assert_eq!(
            select_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        /// Submitted; the GPU finishes after this many more waits.
        Pending(u32),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(u64),
        Reset(u64),
        Acquire,
    }

    /// Simulated driver tracking fence states and protocol violations.
    #[derive(Default)]
    struct FakeDriver {
        fences: RefCell<HashMap<u64, FenceState>>,
        acquires: RefCell<VecDeque<(vk::Result, u32)>>,
        calls: RefCell<Vec<Call>>,
        violations: RefCell<Vec<String>>,
        next_image: RefCell<u32>,
        image_count: u32,
    }

    impl FakeDriver {
        fn new(fences: &[vk::Fence], image_count: u32) -> Self {
            let driver = Self {
                image_count,
                ..Self::default()
            };
            for fence in fences {
                driver
                    .fences
                    .borrow_mut()
                    .insert(fence.as_raw(), FenceState::Signaled);
            }
            driver
        }

        fn script(&self, code: vk::Result, index: u32) {
            self.acquires.borrow_mut().push_back((code, index));
        }

        fn state(&self, fence: vk::Fence) -> FenceState {
            self.fences.borrow()[&fence.as_raw()]
        }

        /// Simulate recording into the slot guarded by `fence`.
        fn record(&self, fence: vk::Fence) {
            if self.state(fence) != FenceState::Unsignaled {
                self.violations.borrow_mut().push(format!(
                    "recorded slot {} while fence {:?}",
                    fence.as_raw(),
                    self.state(fence)
                ));
            }
        }

        /// Mark `fence` as guarding work still running on the GPU.
        fn start_pending(&self, fence: vk::Fence, gpu_waits: u32) {
            self.fences
                .borrow_mut()
                .insert(fence.as_raw(), FenceState::Pending(gpu_waits));
        }

        /// Simulate a queue submission signaling `fence` later.
        fn submit(&self, fence: vk::Fence, gpu_waits: u32) {
            if self.state(fence) != FenceState::Unsignaled {
                self.violations
                    .borrow_mut()
                    .push(format!("submitted with fence {} not reset", fence.as_raw()));
            }
            self.fences
                .borrow_mut()
                .insert(fence.as_raw(), FenceState::Pending(gpu_waits));
        }
    }

    impl FenceDriver for FakeDriver {
        fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
            self.calls.borrow_mut().push(Call::Wait(fence.as_raw()));
            let mut fences = self.fences.borrow_mut();
            let state = fences.get_mut(&fence.as_raw()).expect("unknown fence");
            match *state {
                FenceState::Signaled => Ok(()),
                FenceState::Pending(0) => {
                    *state = FenceState::Signaled;
                    Ok(())
                }
                FenceState::Pending(n) => {
                    *state = FenceState::Pending(n - 1);
                    Err(vk::Result::TIMEOUT)
                }
                FenceState::Unsignaled => {
                    self.violations
                        .borrow_mut()
                        .push(format!("waited on fence {} that can never signal", fence.as_raw()));
                    Err(vk::Result::ERROR_DEVICE_LOST)
                }
            }
        }

        fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
            self.calls.borrow_mut().push(Call::Reset(fence.as_raw()));
            let mut fences = self.fences.borrow_mut();
            let state = fences.get_mut(&fence.as_raw()).expect("unknown fence");
            if let FenceState::Pending(_) = *state {
                self.violations
                    .borrow_mut()
                    .push(format!("reset fence {} while pending", fence.as_raw()));
            }
            *state = FenceState::Unsignaled;
            Ok(())
        }

        fn wait_idle(&self) -> VkResult<()> {
            for state in self.fences.borrow_mut().values_mut() {
                if let FenceState::Pending(_) = state {
                    *state = FenceState::Signaled;
                }
            }
            Ok(())
        }
    }

    impl SwapchainDriver for FakeDriver {
        fn acquire_next_image(
            &self,
            _swapchain: vk::SwapchainKHR,
            _timeout_ns: u64,
            _semaphore: vk::Semaphore,
        ) -> (vk::Result, u32) {
            self.calls.borrow_mut().push(Call::Acquire);
            if let Some(scripted) = self.acquires.borrow_mut().pop_front() {
                return scripted;
            }
            let mut next = self.next_image.borrow_mut();
            let index = *next;
            *next = (index + 1) % self.image_count;
            (vk::Result::SUCCESS, index)
        }
    }

    fn handles(count: u64) -> (Vec<vk::Fence>, Vec<vk::Semaphore>) {
        (
            (1..=count).map(vk::Fence::from_raw).collect(),
            (1..=count).map(vk::Semaphore::from_raw).collect(),
        )
    }

    #[test]
    fn slots_are_never_recorded_while_in_flight() {
        const SLOTS: usize = 2;
        let (fences, semaphores) = handles(SLOTS as u64);
        let driver = FakeDriver::new(&fences, 3);
        let swapchain = vk::SwapchainKHR::from_raw(7);

        for frame in 0..24 {
            let slot = frame % SLOTS;
            let acquired =
                get_next_image(&driver, swapchain, fences[slot], semaphores[slot]).unwrap();
            assert_eq!(acquired.state, SwapchainState::Ok);
            assert!(acquired.index < 3);

            driver.record(fences[slot]);
            // The GPU needs a few polls before each submission completes
            driver.submit(fences[slot], (frame % 4) as u32);
        }

        assert!(
            driver.violations.borrow().is_empty(),
            "{:?}",
            driver.violations.borrow()
        );
    }

    #[test]
    fn fence_is_waited_before_it_is_reset() {
        let (fences, semaphores) = handles(1);
        let driver = FakeDriver::new(&fences, 2);
        driver.start_pending(fences[0], 2);

        get_next_image(
            &driver,
            vk::SwapchainKHR::from_raw(1),
            fences[0],
            semaphores[0],
        )
        .unwrap();

        let calls = driver.calls.borrow();
        assert_eq!(
            *calls,
            vec![
                Call::Wait(1),
                Call::Wait(1),
                Call::Wait(1),
                Call::Acquire,
                Call::Reset(1)
            ]
        );
        assert!(driver.violations.borrow().is_empty());
    }

    #[test]
    fn out_of_date_leaves_fence_signaled() {
        let (fences, semaphores) = handles(1);
        let driver = FakeDriver::new(&fences, 3);
        driver.script(vk::Result::ERROR_OUT_OF_DATE_KHR, 1);

        let acquired = get_next_image(
            &driver,
            vk::SwapchainKHR::from_raw(1),
            fences[0],
            semaphores[0],
        )
        .unwrap();

        assert_eq!(
            acquired,
            AcquireResult {
                index: 1,
                state: SwapchainState::OutOfDate
            }
        );
        assert_eq!(driver.state(fences[0]), FenceState::Signaled);

        // The slot is immediately reusable on the next attempt
        let retry = get_next_image(
            &driver,
            vk::SwapchainKHR::from_raw(2),
            fences[0],
            semaphores[0],
        )
        .unwrap();
        assert_eq!(retry.state, SwapchainState::Ok);
        assert!(driver.violations.borrow().is_empty());
    }

    #[test]
    fn suboptimal_image_is_still_usable() {
        let (fences, semaphores) = handles(1);
        let driver = FakeDriver::new(&fences, 3);
        driver.script(vk::Result::SUBOPTIMAL_KHR, 2);

        let acquired = get_next_image(
            &driver,
            vk::SwapchainKHR::from_raw(1),
            fences[0],
            semaphores[0],
        )
        .unwrap();

        assert_eq!(acquired.index, 2);
        assert_eq!(acquired.state, SwapchainState::Suboptimal);
        assert!(acquired.state.needs_recreate());
        assert_eq!(driver.state(fences[0]), FenceState::Unsignaled);
    }

    #[test]
    fn hard_acquire_error_propagates() {
        let (fences, semaphores) = handles(1);
        let driver = FakeDriver::new(&fences, 3);
        driver.script(vk::Result::ERROR_SURFACE_LOST_KHR, 0);

        let err = get_next_image(
            &driver,
            vk::SwapchainKHR::from_raw(1),
            fences[0],
            semaphores[0],
        )
        .unwrap_err();

        assert!(err.to_string().contains(&vk::Result::ERROR_SURFACE_LOST_KHR.to_string()));
        assert_eq!(driver.state(fences[0]), FenceState::Signaled);
    }
}
