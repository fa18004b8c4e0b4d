//! Cube environment maps rendered around a scene node.
//!
//! The six faces are independent passes; mip generation waits on all of
//! them.

use crate::component::{
    step, visit_graph, ComponentState, CpuUpdater, FrameComponent, GpuUpdater, ProgressBar,
    RenderTechniqueVisitor, UpdateTracker,
};
use crate::graph::{FrameGraph, PassDesc, RunnableGraph};
use crate::passes::{MipChainPass, OwnedPipeline, PassStep, ScenePass};
use crate::registry::RegistryIndex;
use crate::render_device::RenderDevice;
use crate::scene::{scene_vertex_input, SceneGeometry, SceneNodeId};
use crate::shaders;
use castor3d_gpu::{
    full_mip_count, vk, ColorAttachment, DepthAttachment, DescriptorPool, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, GpuError, GpuImage, GraphicsPipelineConfig, ImageDesc, QueueKind,
    Result, SemaphoreWait, SemaphoreWaitArray, UniformBufferOffset, UniformBufferPool,
};
use glam::{Mat4, Vec3};
use std::sync::Arc;

pub const ENVIRONMENT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const NEAR: f32 = 0.1;

/// Layout, pool, pipeline, two images and the graph.
const INITIALISATION_STEPS: u32 = 6;

/// Per-face view data.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EnvironmentUbo {
    pub view_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

/// View matrices of the six cube faces, in layer order +X, -X, +Y, -Y, +Z, -Z.
pub fn face_views(position: Vec3) -> [Mat4; 6] {
    const FACES: [(Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::NEG_Y),
        (Vec3::NEG_X, Vec3::NEG_Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::NEG_Z),
        (Vec3::Z, Vec3::NEG_Y),
        (Vec3::NEG_Z, Vec3::NEG_Y),
    ];
    FACES.map(|(direction, up)| Mat4::look_to_rh(position, direction, up))
}

/// A cube map of the scene as seen from one node.
pub struct EnvironmentMap {
    graph: RunnableGraph,
    index: RegistryIndex,
    node: SceneNodeId,
    uniforms: UniformBufferPool,
    faces: Vec<UniformBufferOffset<EnvironmentUbo>>,
    face_data: [EnvironmentUbo; 6],
    tracker: UpdateTracker,
    frame: u64,
    _pipeline: OwnedPipeline,
    _pool: DescriptorPool,
    _layout: DescriptorSetLayout,
    _depth: GpuImage,
    color: GpuImage,
}

impl EnvironmentMap {
    pub fn new(
        render: &RenderDevice,
        node: SceneNodeId,
        geometry: Arc<dyn SceneGeometry>,
        mut progress: Option<&mut dyn ProgressBar>,
    ) -> Result<Self> {
        let device = render.device().clone();
        let index = render.registry().acquire("EnvironmentMap");
        let name = format!("EnvironmentMap{}", index.index());
        let size = render.config().environment.face_size;
        let mips = full_mip_count(size);

        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(device.clone())?;
        step(&mut progress, "EnvironmentMap layout");

        let mut color = GpuImage::new(
            device.clone(),
            &ImageDesc::new_cube(&format!("{name}/Colour"), ENVIRONMENT_FORMAT, size)
                .mip_levels(mips)
                .usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::SAMPLED
                        | vk::ImageUsageFlags::TRANSFER_SRC
                        | vk::ImageUsageFlags::TRANSFER_DST,
                ),
            vk::ImageViewType::CUBE,
        )?;
        step(&mut progress, "EnvironmentMap colour");
        let mut depth = GpuImage::new(
            device.clone(),
            &ImageDesc::new_2d(&format!("{name}/Depth"), DEPTH_FORMAT, size, size)
                .array_layers(6)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
            vk::ImageViewType::TYPE_2D_ARRAY,
        )?;
        step(&mut progress, "EnvironmentMap depth");

        let mut uniforms = render.uniform_pool(&name);
        let mut faces = Vec::with_capacity(6);
        for _ in 0..6 {
            faces.push(uniforms.get_buffer::<EnvironmentUbo>()?);
        }
        let mut pool = DescriptorPool::new(device.clone(), &layout, 6)?;
        let mut sets = Vec::with_capacity(6);
        for face in &faces {
            sets.push(pool.allocate(&[face.descriptor_write(0)])?);
        }
        step(&mut progress, "EnvironmentMap descriptors");

        let shaders = render.shaders();
        let (vertex_bindings, vertex_attributes) = scene_vertex_input();
        let pipeline = OwnedPipeline::graphics(
            device.clone(),
            &GraphicsPipelineConfig {
                vertex_shader: shaders.shader(shaders::ENVIRONMENT_VERT)?,
                fragment_shader: shaders.shader(shaders::ENVIRONMENT_FRAG)?,
                vertex_bindings,
                vertex_attributes,
                color_formats: vec![ENVIRONMENT_FORMAT],
                depth_format: Some(DEPTH_FORMAT),
                ..GraphicsPipelineConfig::default()
            },
            &[layout.handle()],
            &[],
        )?;
        step(&mut progress, "EnvironmentMap pipeline");

        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        let mut graph = FrameGraph::new(name.as_str())
            .with_frames_in_flight(render.config().frames_in_flight);
        let cube = graph.add_image("Cube");
        let mut face_resources = Vec::with_capacity(6);
        for face in 0..6u32 {
            let face_resource = graph.add_image(format!("Face{face}"));
            face_resources.push(face_resource);
            let color_view = color.sub_view(vk::ImageViewType::TYPE_2D, 0, face, 1)?;
            let depth_view = depth.sub_view(vk::ImageViewType::TYPE_2D, 0, face, 1)?;
            let pass = ScenePass::new(pipeline.get(), sets[face as usize], extent, geometry.clone())
                .color(ColorAttachment {
                    view: color_view,
                    clear: Some([0.0, 0.0, 0.0, 1.0]),
                })
                .depth(DepthAttachment {
                    view: depth_view,
                    clear: Some(1.0),
                })
                .before(PassStep::transition(
                    color.image(),
                    color.sub_range(0, face, 1),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ))
                .before(PassStep::transition(
                    depth.image(),
                    depth.sub_range(0, face, 1),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                ));
            graph.add_pass(
                PassDesc::new(format!("Face{face}"), pass)
                    .writes(face_resource)
                    .wait_stage(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
            );
        }
        let mut mips_pass = PassDesc::new(
            "Mips",
            MipChainPass {
                image: color.image(),
                extent: color.extent(),
                mip_levels: mips,
                array_layers: 6,
                initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        )
        .writes(cube)
        .wait_stage(vk::PipelineStageFlags::TRANSFER)
        .output_stage(vk::PipelineStageFlags::FRAGMENT_SHADER);
        for face_resource in face_resources {
            mips_pass = mips_pass.reads(face_resource);
        }
        graph.add_pass(mips_pass);
        let graph = graph.compile(device)?;
        step(&mut progress, "EnvironmentMap graph");

        tracing::info!(name = %name, size, mips, "Initialised environment map");

        Ok(Self {
            graph,
            index,
            node,
            uniforms,
            faces,
            face_data: [EnvironmentUbo::default(); 6],
            tracker: UpdateTracker::ready(),
            frame: 0,
            _pipeline: pipeline,
            _pool: pool,
            _layout: layout,
            _depth: depth,
            color,
        })
    }

    pub const fn count_initialisation_steps() -> u32 {
        INITIALISATION_STEPS
    }

    /// Instance index, unique among live environment maps.
    pub fn index(&self) -> u32 {
        self.index.index()
    }

    pub fn node(&self) -> SceneNodeId {
        self.node
    }

    pub fn face_data(&self) -> &[EnvironmentUbo; 6] {
        &self.face_data
    }

    pub fn graph(&self) -> &RunnableGraph {
        &self.graph
    }

    /// The cube map, valid for sampling once the returned waits are met.
    pub fn image(&self) -> &GpuImage {
        &self.color
    }
}

impl FrameComponent for EnvironmentMap {
    fn name(&self) -> &str {
        self.graph.name()
    }

    fn state(&self) -> ComponentState {
        self.tracker.state
    }

    fn update_cpu(&mut self, updater: &CpuUpdater<'_>) -> Result<()> {
        let position = updater.scene.node_position(self.node).ok_or_else(|| {
            GpuError::ResourceNotFound(format!(
                "scene node {} observed by {}",
                self.node.0,
                self.graph.name()
            ))
        })?;
        let projection =
            Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, NEAR, updater.camera.far);
        for (data, view) in self.face_data.iter_mut().zip(face_views(position)) {
            *data = EnvironmentUbo {
                view_projection: (projection * view).to_cols_array_2d(),
                position: position.extend(1.0).to_array(),
            };
        }
        self.frame = updater.frame;
        self.tracker.cpu_updated(updater.frame);
        Ok(())
    }

    fn update_gpu(&mut self, updater: &GpuUpdater) -> Result<()> {
        self.tracker.check_gpu_update(self.graph.name(), updater.frame)?;
        for (slot, data) in self.faces.iter().zip(&self.face_data) {
            self.uniforms.write(slot, data)?;
        }
        if let Some(cb) = updater.upload {
            self.uniforms.upload(cb)?;
        }
        Ok(())
    }

    fn render(&mut self, to_wait: &[SemaphoreWait], queue: QueueKind) -> Result<SemaphoreWaitArray> {
        let waits = self.graph.run(to_wait, queue, self.frame)?;
        self.tracker.rendered();
        Ok(waits)
    }

    fn accept(&self, visitor: &mut dyn RenderTechniqueVisitor) {
        let name = self.graph.name();
        visit_graph(name, &self.graph, visitor);
        visitor.visit_image(name, "Colour", self.color.image());
    }

    fn count_initialisation_steps(&self) -> u32 {
        INITIALISATION_STEPS
    }
}
