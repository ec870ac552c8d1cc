//! Graphics pipeline creation.

use crate::error::{GpuError, Result};
use crate::shader::ShaderModule;
use ash::vk;
use std::sync::Arc;

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: None,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Reject configurations the driver would fail on less helpfully.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.vertex_shader.is_empty() {
            Some("missing vertex shader")
        } else if self.fragment_shader.is_empty() {
            Some("missing fragment shader")
        } else if self.color_formats.is_empty() {
            Some("no color attachment formats")
        } else if (self.depth_test || self.depth_write) && self.depth_format.is_none() {
            Some("depth testing requires a depth format")
        } else {
            None
        };

        match problem {
            Some(problem) => {
                tracing::error!("Invalid pipeline configuration: {problem}");
                Err(GpuError::PipelineCreation(problem.to_string()))
            }
            None => Ok(()),
        }
    }
}

/// Graphics pipeline wrapper. Destroys the pipeline and its layout on drop.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<ash::Device>,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline using dynamic rendering (Vulkan 1.3).
    ///
    /// Viewport and scissor are dynamic, so the pipeline survives swapchain
    /// resizes as long as the color format does not change.
    pub fn new(
        device: Arc<ash::Device>,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        config.validate()?;

        // Modules are only needed until the pipeline exists
        let vert_module = ShaderModule::new(device.clone(), &config.vertex_shader, vk::ShaderStageFlags::VERTEX)?;
        let frag_module =
            ShaderModule::new(device.clone(), &config.fragment_shader, vk::ShaderStageFlags::FRAGMENT)?;

        let shader_stages = [vert_module.stage_info(), frag_module.stage_info()];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> = config
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(|e| {
            tracing::error!("Pipeline layout creation failed: {e}");
            GpuError::PipelineCreation(e.to_string())
        })?;

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&config.color_formats);

        if let Some(depth_format) = config.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        let pipeline = match pipelines.map(|p| p.into_iter().next()) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(
                    "Driver returned no pipeline".to_string(),
                ));
            }
            Err((_pipelines, e)) => {
                tracing::error!("Graphics pipeline creation failed: {e}");
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        Ok(Self {
            pipeline,
            layout,
            device,
        })
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shaders() -> GraphicsPipelineConfig {
        GraphicsPipelineConfig {
            vertex_shader: vec![crate::shader::SPIRV_MAGIC],
            fragment_shader: vec![crate::shader::SPIRV_MAGIC],
            ..Default::default()
        }
    }

    #[test]
    fn default_targets_swapchain_without_depth() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.color_formats, vec![vk::Format::B8G8R8A8_SRGB]);
        assert!(config.depth_format.is_none());
        assert!(!config.depth_test);
    }

    #[test]
    fn validate_requires_both_shaders() {
        assert!(GraphicsPipelineConfig::default().validate().is_err());
        assert!(shaders().validate().is_ok());

        let no_frag = GraphicsPipelineConfig {
            fragment_shader: Vec::new(),
            ..shaders()
        };
        assert!(no_frag.validate().is_err());
    }

    #[test]
    fn depth_test_needs_depth_format() {
        let config = GraphicsPipelineConfig {
            depth_test: true,
            ..shaders()
        };
        assert!(matches!(
            config.validate(),
            Err(GpuError::PipelineCreation(_))
        ));

        let config = GraphicsPipelineConfig {
            depth_format: Some(vk::Format::D32_SFLOAT),
            ..config
        };
        assert!(config.validate().is_ok());
    }
}
