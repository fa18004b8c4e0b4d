//! Pipeline descriptions.

use ash::vk;

/// A created pipeline with its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

/// Colour blending applied to every attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// Straight-alpha source-over blending.
    AlphaBlend,
}

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub geometry_shader: Option<Vec<u32>>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: BlendMode,
    /// Empty for passes that only write storage images.
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub conservative_rasterization: bool,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            geometry_shader: None,
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            blend: BlendMode::Opaque,
            color_formats: vec![vk::Format::R8G8B8A8_UNORM],
            depth_format: Some(vk::Format::D32_SFLOAT),
            conservative_rasterization: false,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Alpha-blended, depthless configuration used for 2D overlays.
    pub fn overlay(color_format: vk::Format) -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            blend: BlendMode::AlphaBlend,
            color_formats: vec![color_format],
            depth_format: None,
            ..Self::default()
        }
    }

    /// Depth-only configuration used for shadow maps.
    pub fn depth_only(depth_format: vk::Format) -> Self {
        Self {
            color_formats: Vec::new(),
            depth_format: Some(depth_format),
            cull_mode: vk::CullModeFlags::FRONT,
            ..Self::default()
        }
    }
}
