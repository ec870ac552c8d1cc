//! Sampled 2D textures.

use std::path::Path;

use ash::vk;
use ember_gpu::command::{execute_single_time_commands, transition_image_layout, CommandPool};
use ember_gpu::{GpuAllocator, GpuContext, GpuError, GpuImage, Result};
use gpu_allocator::MemoryLocation;

/// Texel format of every texture; 8-bit RGBA with sRGB decoding.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Device-local RGBA texture with view and sampler.
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub width: u32,
    pub height: u32,
}

impl Texture {
    /// Upload tightly packed RGBA8 pixels.
    ///
    /// Blocks until the upload has completed on `gpu`'s graphics queue;
    /// `pool` must belong to the graphics family.
    pub fn from_rgba8(
        gpu: &GpuContext,
        pool: &CommandPool,
        width: u32,
        height: u32,
        pixels: &[u8],
        name: &str,
    ) -> Result<Self> {
        check_dimensions(width, height, pixels.len())?;

        let device = gpu.device();
        let mut allocator = gpu.allocator().lock();

        let mut staging = allocator.create_buffer_with_data(
            pixels,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &format!("{name} staging"),
        )?;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = allocator.create_image(&image_info, MemoryLocation::GpuOnly, name);
        let mut image = match image {
            Ok(image) => image,
            Err(e) => {
                allocator.free_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let uploaded = unsafe {
            execute_single_time_commands(device, pool, gpu.queues().graphics, |cmd| {
                transition_image_layout(
                    device,
                    cmd,
                    image.image,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );

                let region = vk::BufferImageCopy::default()
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(0)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
                    .image_extent(image_info.extent);

                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                transition_image_layout(
                    device,
                    cmd,
                    image.image,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            })
        };

        // The upload waited for queue idle, so staging can go either way
        allocator.free_buffer(&mut staging)?;
        if let Err(e) = uploaded {
            allocator.free_image(&mut image)?;
            return Err(e);
        }

        let view = match unsafe { create_view(device, image.image) } {
            Ok(view) => view,
            Err(e) => {
                allocator.free_image(&mut image)?;
                return Err(e);
            }
        };

        let anisotropy = gpu
            .device_info()
            .features
            .sampler_anisotropy
            .then_some(gpu.device_info().max_sampler_anisotropy);

        let sampler = match unsafe { create_sampler(device, anisotropy) } {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { device.destroy_image_view(view, None) };
                allocator.free_image(&mut image)?;
                return Err(e);
            }
        };

        tracing::debug!("Uploaded texture '{name}' ({width}x{height})");

        Ok(Self {
            image,
            view,
            sampler,
            width,
            height,
        })
    }

    /// Decode an image file and upload it.
    pub fn load(gpu: &GpuContext, pool: &CommandPool, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| {
                tracing::error!("Failed to load texture {}: {e}", path.display());
                GpuError::InvalidState(format!("Failed to load texture {}: {e}", path.display()))
            })?
            .to_rgba8();

        let (width, height) = decoded.dimensions();
        let name = path
            .file_name()
            .map_or_else(|| "texture".to_string(), |n| n.to_string_lossy().into_owned());

        Self::from_rgba8(gpu, pool, width, height, decoded.as_raw(), &name)
    }

    /// Release the texture. The GPU must no longer be using it.
    pub fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
        }
        allocator.free_image(&mut self.image)
    }
}

/// Reject pixel buffers that do not match `width * height` RGBA texels.
fn check_dimensions(width: u32, height: u32, len: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(GpuError::InvalidState(format!(
            "Texture has zero size ({width}x{height})"
        )));
    }

    let expected = width as usize * height as usize * 4;
    if len != expected {
        tracing::error!("Texture data is {len} bytes, expected {expected}");
        return Err(GpuError::InvalidState(format!(
            "Texture data is {len} bytes, expected {expected} for {width}x{height} RGBA"
        )));
    }

    Ok(())
}

/// RGBA8 checkerboard of `size`x`size` texels with `cells` squares per side.
pub fn checkerboard_rgba8(size: u32, cells: u32, light: [u8; 4], dark: [u8; 4]) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    (0..size)
        .flat_map(|y| (0..size).map(move |x| (x, y)))
        .flat_map(|(x, y)| {
            if (x / cell + y / cell) % 2 == 0 {
                light
            } else {
                dark
            }
        })
        .collect()
}

unsafe fn create_view(device: &ash::Device, image: vk::Image) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(TEXTURE_FORMAT)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );

    device.create_image_view(&view_info, None).map_err(|e| {
        tracing::error!("Texture view creation failed: {e}");
        GpuError::ImageViewCreation(e.to_string())
    })
}

unsafe fn create_sampler(device: &ash::Device, anisotropy: Option<f32>) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .max_lod(vk::LOD_CLAMP_NONE);

    device.create_sampler(&sampler_info, None).map_err(|e| {
        tracing::error!("Sampler creation failed: {e}");
        GpuError::from(e)
    })
}
