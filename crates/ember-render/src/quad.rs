//! Textured quad renderer.
//!
//! Draws a single unit quad in the XY plane, textured and transformed by the
//! camera, straight into a swapchain image using dynamic rendering. Each
//! frame slot has its own uniform buffer and descriptor set so a slot can be
//! updated while others are still in flight.

use std::mem::{offset_of, size_of};

use ash::vk;
use ember_gpu::command::transition_image_layout;
use ember_gpu::descriptors::{write_combined_image_sampler, write_uniform_buffer};
use ember_gpu::{
    DescriptorPool, DescriptorSetLayoutBuilder, GpuAllocator, GpuBuffer, GpuContext, GpuError,
    GraphicsPipeline, GraphicsPipelineConfig, Result,
};
use gpu_allocator::MemoryLocation;

use crate::camera::{Camera, CameraUniforms};
use crate::texture::Texture;

/// Quad vertex: position and texture coordinate.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

/// Corners of a unit quad centred on the origin.
pub const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex {
        position: [-0.5, -0.5, 0.0],
        uv: [0.0, 1.0],
    },
    QuadVertex {
        position: [0.5, -0.5, 0.0],
        uv: [1.0, 1.0],
    },
    QuadVertex {
        position: [0.5, 0.5, 0.0],
        uv: [1.0, 0.0],
    },
    QuadVertex {
        position: [-0.5, 0.5, 0.0],
        uv: [0.0, 0.0],
    },
];

/// Two counter-clockwise triangles.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Vertex buffer layout matching the quad shaders.
pub fn vertex_layout() -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let bindings = vec![vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(size_of::<QuadVertex>() as u32)
        .input_rate(vk::VertexInputRate::VERTEX)];

    let attributes = vec![
        vk::VertexInputAttributeDescription::default()
            .location(0)
            .binding(0)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(offset_of!(QuadVertex, position) as u32),
        vk::VertexInputAttributeDescription::default()
            .location(1)
            .binding(0)
            .format(vk::Format::R32G32_SFLOAT)
            .offset(offset_of!(QuadVertex, uv) as u32),
    ];

    (bindings, attributes)
}

/// Full-extent viewport and scissor.
pub fn viewport_and_scissor(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// Compiled quad shaders.
#[derive(Clone)]
pub struct QuadShaders {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

/// Renders one textured quad per frame.
pub struct QuadRenderer {
    pipeline: GraphicsPipeline,
    color_format: vk::Format,
    shaders: QuadShaders,
    descriptor_set_layout: vk::DescriptorSetLayout,
    // Kept alive for the descriptor sets allocated from it
    #[allow(dead_code)]
    descriptor_pool: DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    uniform_buffers: Vec<GpuBuffer>,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
}

impl QuadRenderer {
    /// Create the renderer for images of `color_format`.
    pub fn new(
        gpu: &GpuContext,
        color_format: vk::Format,
        texture: &Texture,
        frames_in_flight: usize,
        shaders: QuadShaders,
    ) -> Result<Self> {
        let set_count = frames_in_flight as u32;

        let layout_builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT);
        let pool_sizes = layout_builder.pool_sizes(set_count);
        let descriptor_set_layout = unsafe { layout_builder.build(gpu.device())? };

        let renderer = Self::with_layout(
            gpu,
            color_format,
            texture,
            frames_in_flight,
            shaders,
            descriptor_set_layout,
            &pool_sizes,
        );
        if renderer.is_err() {
            // Everything else was released by its owner
            unsafe { gpu.device().destroy_descriptor_set_layout(descriptor_set_layout, None) };
        }
        renderer
    }

    fn with_layout(
        gpu: &GpuContext,
        color_format: vk::Format,
        texture: &Texture,
        frames_in_flight: usize,
        shaders: QuadShaders,
        descriptor_set_layout: vk::DescriptorSetLayout,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let device = gpu.device();

        let pipeline = create_pipeline(gpu, color_format, &shaders, descriptor_set_layout)?;

        let descriptor_pool =
            DescriptorPool::new(gpu.device_arc().clone(), frames_in_flight as u32, pool_sizes)?;
        let layouts = vec![descriptor_set_layout; frames_in_flight];
        let descriptor_sets = descriptor_pool.allocate(&layouts)?;

        // Buffers go last: nothing after them can fail
        let uniform_size = size_of::<CameraUniforms>() as u64;
        let mut allocator = gpu.allocator().lock();
        let mut buffers = create_all(
            &mut *allocator,
            GEOMETRY_BUFFERS + frames_in_flight,
            |allocator, i| match i {
                0 => allocator.create_buffer_with_data(
                    &QUAD_VERTICES,
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    "quad vertices",
                ),
                1 => allocator.create_buffer_with_data(
                    &QUAD_INDICES,
                    vk::BufferUsageFlags::INDEX_BUFFER,
                    "quad indices",
                ),
                n => allocator.create_buffer(
                    uniform_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                    &format!("camera uniforms {}", n - GEOMETRY_BUFFERS),
                ),
            },
            free_quietly,
        )?;

        let uniform_buffers = buffers.split_off(GEOMETRY_BUFFERS);
        let index_buffer = buffers.pop();
        let vertex_buffer = buffers.pop();
        let (Some(vertex_buffer), Some(index_buffer)) = (vertex_buffer, index_buffer) else {
            for buffer in uniform_buffers {
                free_quietly(&mut allocator, buffer);
            }
            return Err(GpuError::InvalidState("Quad geometry buffers missing".to_string()));
        };
        drop(allocator);

        for (set, buffer) in descriptor_sets.iter().zip(&uniform_buffers) {
            unsafe {
                write_uniform_buffer(device, *set, 0, buffer.buffer, 0, uniform_size);
                write_combined_image_sampler(
                    device,
                    *set,
                    1,
                    texture.view,
                    texture.sampler,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        }

        tracing::debug!("Quad renderer ready ({frames_in_flight} frame slots, {color_format:?})");

        Ok(Self {
            pipeline,
            color_format,
            shaders,
            descriptor_set_layout,
            descriptor_pool,
            descriptor_sets,
            uniform_buffers,
            vertex_buffer,
            index_buffer,
        })
    }

    /// Color format the pipeline renders to.
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    /// Rebuild the pipeline if the swapchain format changed.
    ///
    /// The old pipeline is destroyed immediately, so the device must be idle.
    pub fn ensure_format(&mut self, gpu: &GpuContext, color_format: vk::Format) -> Result<()> {
        if color_format == self.color_format {
            return Ok(());
        }
        tracing::info!(
            "Swapchain format changed ({:?} -> {:?}), rebuilding quad pipeline",
            self.color_format,
            color_format
        );
        self.pipeline = create_pipeline(gpu, color_format, &self.shaders, self.descriptor_set_layout)?;
        self.color_format = color_format;
        Ok(())
    }

    /// Write the camera into a frame slot's uniform buffer.
    ///
    /// The slot's fence must have signaled.
    pub fn update_camera(&self, slot: usize, camera: &dyn Camera) -> Result<()> {
        let buffer = self.uniform_buffers.get(slot).ok_or_else(|| {
            GpuError::InvalidState(format!("No uniform buffer for frame slot {slot}"))
        })?;
        buffer.write(&[camera.uniforms()])
    }

    /// Record the quad into `image`, leaving it ready for presentation.
    ///
    /// # Safety
    /// `cmd` must be recording, and `image`/`view` must belong to a
    /// swapchain image of this renderer's color format.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        view: vk::ImageView,
        extent: vk::Extent2D,
        slot: usize,
        clear_color: [f32; 4],
    ) -> Result<()> {
        let descriptor_set = *self.descriptor_sets.get(slot).ok_or_else(|| {
            GpuError::InvalidState(format!("No descriptor set for frame slot {slot}"))
        })?;

        unsafe {
            transition_image_layout(
                device,
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );

            let color_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color,
                    },
                });

            let (viewport, scissor) = viewport_and_scissor(extent);

            let rendering_info = vk::RenderingInfo::default()
                .render_area(scissor)
                .layer_count(1)
                .color_attachments(std::slice::from_ref(&color_attachment));

            device.cmd_begin_rendering(cmd, &rendering_info);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, QUAD_INDICES.len() as u32, 1, 0, 0, 0);

            device.cmd_end_rendering(cmd);

            transition_image_layout(
                device,
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }

        Ok(())
    }

    /// Release GPU resources. The GPU must no longer be using them.
    pub fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        for buffer in &mut self.uniform_buffers {
            allocator.free_buffer(buffer)?;
        }
        allocator.free_buffer(&mut self.vertex_buffer)?;
        allocator.free_buffer(&mut self.index_buffer)?;
        unsafe {
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        Ok(())
    }
}

/// Vertex and index buffer, ahead of the per-slot uniform buffers.
const GEOMETRY_BUFFERS: usize = 2;

/// Create `count` resources in order.
///
/// If one fails, the ones already created are handed to `release`, newest
/// first, and the error is returned.
fn create_all<X: ?Sized, T, C, R>(context: &mut X, count: usize, mut create: C, mut release: R) -> Result<Vec<T>>
where
    C: FnMut(&mut X, usize) -> Result<T>,
    R: FnMut(&mut X, T),
{
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        match create(context, i) {
            Ok(resource) => created.push(resource),
            Err(e) => {
                tracing::error!("Quad resource {i} creation failed: {e}");
                while let Some(resource) = created.pop() {
                    release(context, resource);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

fn free_quietly(allocator: &mut GpuAllocator, mut buffer: GpuBuffer) {
    if let Err(e) = allocator.free_buffer(&mut buffer) {
        tracing::warn!("Failed to free buffer during cleanup: {e}");
    }
}

fn create_pipeline(
    gpu: &GpuContext,
    color_format: vk::Format,
    shaders: &QuadShaders,
    descriptor_set_layout: vk::DescriptorSetLayout,
) -> Result<GraphicsPipeline> {
    let (vertex_bindings, vertex_attributes) = vertex_layout();

    let config = GraphicsPipelineConfig {
        vertex_shader: shaders.vertex.clone(),
        fragment_shader: shaders.fragment.clone(),
        vertex_bindings,
        vertex_attributes,
        // Both faces stay visible while the camera circles the quad
        cull_mode: vk::CullModeFlags::NONE,
        color_formats: vec![color_format],
        ..Default::default()
    };

    GraphicsPipeline::new(gpu.device_arc().clone(), &config, &[descriptor_set_layout], &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_reference_existing_vertices() {
        assert!(QUAD_INDICES
            .iter()
            .all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn triangles_are_counter_clockwise() {
        for tri in QUAD_INDICES.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| QUAD_VERTICES[i as usize].position);
            let cross_z = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            assert!(cross_z > 0.0);
        }
    }

    #[test]
    fn layout_matches_vertex_struct() {
        let (bindings, attributes) = vertex_layout();
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[1].location, 1);
    }

    #[test]
    fn partial_creation_is_released_newest_first() {
        let mut released = Vec::new();
        let result = create_all(
            &mut released,
            4,
            |_, i| {
                if i == 2 {
                    Err(GpuError::AllocationFailed("out of memory".to_string()))
                } else {
                    Ok(i)
                }
            },
            |released: &mut Vec<usize>, i| released.push(i),
        );

        assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
        assert_eq!(released, vec![1, 0]);
    }

    #[test]
    fn full_creation_releases_nothing() {
        let mut released = Vec::new();
        let created = create_all(
            &mut released,
            3,
            |_, i| Ok(i * 10),
            |released: &mut Vec<usize>, i| released.push(i),
        )
        .unwrap();

        assert_eq!(created, vec![0, 10, 20]);
        assert!(released.is_empty());
    }

    #[test]
    fn viewport_covers_extent() {
        let (viewport, scissor) = viewport_and_scissor(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(viewport.width, 800.0);
        assert_eq!(viewport.height, 600.0);
        assert_eq!(scissor.extent.width, 800);
        assert_eq!(scissor.offset.x, 0);
    }
}
