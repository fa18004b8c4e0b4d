//! Pipeline creation on a Vulkan device.

use crate::error::{GpuError, Result};
use crate::pipeline::{BlendMode, GraphicsPipelineConfig, Pipeline};
use ash::vk;

/// Create a shader module, tagging failures with `stage`.
///
/// # Safety
/// The device must be valid.
unsafe fn shader_module(device: &ash::Device, code: &[u32], stage: &str) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GpuError::ShaderCompileFailed(format!("{stage}: {e}")))
}

/// Create a pipeline layout.
///
/// # Safety
/// The device must be valid.
unsafe fn pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constants);
    unsafe { device.create_pipeline_layout(&info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

fn blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state =
        vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        BlendMode::Opaque => state.blend_enable(false),
        BlendMode::AlphaBlend => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

/// Create a compute pipeline from SPIR-V.
///
/// # Safety
/// The device must be valid and the shader code must be valid SPIR-V.
pub unsafe fn create_compute_pipeline(
    device: &ash::Device,
    shader: &[u32],
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<Pipeline> {
    let module = unsafe { shader_module(device, shader, "Compute") }?;
    let layout = match unsafe { pipeline_layout(device, set_layouts, push_constants) } {
        Ok(layout) => layout,
        Err(err) => {
            unsafe { device.destroy_shader_module(module, None) };
            return Err(err);
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let created = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None) };
    unsafe { device.destroy_shader_module(module, None) };

    match created {
        Ok(pipelines) => Ok(Pipeline {
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        }),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

/// Create a graphics pipeline using dynamic rendering.
///
/// Viewport and scissor are dynamic state.
///
/// # Safety
/// The device must be valid and shader code must be valid SPIR-V.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    config: &GraphicsPipelineConfig,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<Pipeline> {
    let mut modules = Vec::with_capacity(3);
    let mut stages = Vec::with_capacity(3);
    let sources = [
        (vk::ShaderStageFlags::VERTEX, Some(&config.vertex_shader), "Vertex"),
        (
            vk::ShaderStageFlags::GEOMETRY,
            config.geometry_shader.as_ref(),
            "Geometry",
        ),
        (
            vk::ShaderStageFlags::FRAGMENT,
            Some(&config.fragment_shader).filter(|code| !code.is_empty()),
            "Fragment",
        ),
    ];
    for (stage, code, label) in sources {
        let Some(code) = code else { continue };
        match unsafe { shader_module(device, code, label) } {
            Ok(module) => {
                modules.push(module);
                stages.push(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(stage)
                        .module(module)
                        .name(c"main"),
                );
            }
            Err(err) => {
                for module in modules {
                    unsafe { device.destroy_shader_module(module, None) };
                }
                return Err(err);
            }
        }
    }

    let result = unsafe { build_graphics(device, config, &stages, set_layouts, push_constants) };
    for module in modules {
        unsafe { device.destroy_shader_module(module, None) };
    }
    result
}

unsafe fn build_graphics(
    device: &ash::Device,
    config: &GraphicsPipelineConfig,
    stages: &[vk::PipelineShaderStageCreateInfo<'_>],
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<Pipeline> {
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&config.vertex_bindings)
        .vertex_attribute_descriptions(&config.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.topology)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let mut conservative = vk::PipelineRasterizationConservativeStateCreateInfoEXT::default()
        .conservative_rasterization_mode(vk::ConservativeRasterizationModeEXT::OVERESTIMATE);
    let mut rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(config.polygon_mode)
        .cull_mode(config.cull_mode)
        .front_face(config.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);
    if config.conservative_rasterization {
        rasterization = rasterization.push_next(&mut conservative);
    }

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(config.depth_test)
        .depth_write_enable(config.depth_write)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments: Vec<_> = config
        .color_formats
        .iter()
        .map(|_| blend_attachment(config.blend))
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let layout = unsafe { pipeline_layout(device, set_layouts, push_constants) }?;

    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&config.color_formats);
    if let Some(depth_format) = config.depth_format {
        rendering_info = rendering_info.depth_attachment_format(depth_format);
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
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

    match unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    } {
        Ok(pipelines) => Ok(Pipeline {
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        }),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}
