//! Voxel cone tracing: scene voxelisation and light bounces.
//!
//! The scene is rasterised into a voxel storage buffer, which is converted to
//! a 3D texture and mipmapped. An optional secondary bounce cone-traces the
//! first bounce into a second texture, mipmapped in turn.

use crate::component::{
    step, visit_graph, ComponentState, CpuUpdater, FrameComponent, GpuUpdater, ProgressBar,
    RenderTechniqueVisitor, UpdateTracker,
};
use crate::graph::{EnabledFlag, FrameGraph, PassDesc, RunnableGraph};
use crate::passes::{
    group_count, ComputePass, MipChainPass, OwnedBuffer, OwnedPipeline, PassStep,
    ScenePass,
};
use crate::render_device::RenderDevice;
use crate::scene::{scene_vertex_input, SceneGeometry};
use crate::shaders;
use castor3d_core::math::snap_to_step;
use castor3d_core::VoxelConfig;
use castor3d_gpu::{
    vk, BufferDesc, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorWrite, GpuImage, GraphicsPipelineConfig, ImageDesc, MemoryLocation, QueueKind,
    Result, Sampler, SamplerDesc, SemaphoreWait, SemaphoreWaitArray, UniformBufferOffset,
    UniformBufferPool,
};
use glam::Vec3;
use std::sync::Arc;

/// Bytes per voxel in the storage buffer: packed colour and normal.
pub const VOXEL_STRIDE: u64 = 16;
const LOCAL_SIZE: u32 = 4;
const VOXEL_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Layouts, pools, pipelines, buffer, images, sampler and graph.
const INITIALISATION_STEPS: u32 = 14;

/// Grid placement and cone tracing parameters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VoxelizerUbo {
    /// Grid centre in world space, voxel size in `w`.
    pub center_voxel_size: [f32; 4],
    /// Grid size, cone count, secondary bounce and temporal smoothing flags.
    pub grid: [u32; 4],
    /// Max distance, ray step size and voxel size factor.
    pub cone_params: [f32; 4],
}

impl VoxelizerUbo {
    pub fn voxel_size(&self) -> f32 {
        self.center_voxel_size[3]
    }

    pub fn center(&self) -> Vec3 {
        Vec3::from_slice(&self.center_voxel_size[..3])
    }
}

/// Voxel size and snapped grid centre for the given scene and camera.
pub fn grid_placement(config: &VoxelConfig, scene_extent: f32, camera: Vec3) -> (f32, Vec3) {
    let voxel_size =
        (scene_extent * config.voxel_size_factor / config.grid_size as f32).max(1.0e-4);
    (voxel_size, snap_to_step(camera, voxel_size))
}

/// The voxel cone tracing pass chain.
pub struct Voxelizer {
    graph: RunnableGraph,
    secondary_bounce: EnabledFlag,
    config: VoxelConfig,
    uniforms: UniformBufferPool,
    ubo: UniformBufferOffset<VoxelizerUbo>,
    ubo_data: VoxelizerUbo,
    tracker: UpdateTracker,
    frame: u64,
    _pipelines: Vec<OwnedPipeline>,
    _pools: Vec<DescriptorPool>,
    _layouts: Vec<DescriptorSetLayout>,
    _sampler: Sampler,
    voxels: OwnedBuffer,
    first_bounce: GpuImage,
    second_bounce: GpuImage,
}

impl Voxelizer {
    pub fn new(
        render: &RenderDevice,
        geometry: Arc<dyn SceneGeometry>,
        mut progress: Option<&mut dyn ProgressBar>,
    ) -> Result<Self> {
        let device = render.device().clone();
        let config = render.config().voxels.clone();
        let grid = config.grid_size;
        let mips = config.mip_levels();

        let conservative = if config.enable_conservative_rasterization
            && !device.limits().supports_conservative_rasterization
        {
            tracing::warn!("Conservative rasterization requested but unsupported, voxelising without it");
            false
        } else {
            config.enable_conservative_rasterization
        };

        let all_stages = vk::ShaderStageFlags::VERTEX
            | vk::ShaderStageFlags::GEOMETRY
            | vk::ShaderStageFlags::FRAGMENT
            | vk::ShaderStageFlags::COMPUTE;
        let voxelize_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, all_stages)
            .storage_buffer(1, vk::ShaderStageFlags::FRAGMENT)
            .build(device.clone())?;
        step(&mut progress, "Voxelizer/Voxelize layout");
        let to_texture_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
            .storage_image(2, vk::ShaderStageFlags::COMPUTE)
            .build(device.clone())?;
        step(&mut progress, "Voxelizer/BufferToTexture layout");
        let bounce_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .sampled_images(1, 1, vk::ShaderStageFlags::COMPUTE)
            .storage_image(2, vk::ShaderStageFlags::COMPUTE)
            .build(device.clone())?;
        step(&mut progress, "Voxelizer/SecondaryBounce layout");

        let voxels = OwnedBuffer::new(
            device.clone(),
            &BufferDesc {
                name: "Voxelizer/Voxels",
                size: u64::from(grid).pow(3) * VOXEL_STRIDE,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
            },
        )?;
        step(&mut progress, "Voxelizer/Voxels");
        let image_usage = vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let first_bounce = GpuImage::new(
            device.clone(),
            &ImageDesc::new_3d("Voxelizer/FirstBounce", VOXEL_FORMAT, grid)
                .mip_levels(mips)
                .usage(image_usage),
            vk::ImageViewType::TYPE_3D,
        )?;
        step(&mut progress, "Voxelizer/FirstBounce");
        let second_bounce = GpuImage::new(
            device.clone(),
            &ImageDesc::new_3d("Voxelizer/SecondaryBounce", VOXEL_FORMAT, grid)
                .mip_levels(mips)
                .usage(image_usage),
            vk::ImageViewType::TYPE_3D,
        )?;
        step(&mut progress, "Voxelizer/SecondaryBounce");
        let sampler = Sampler::new(device.clone(), &SamplerDesc::default())?;
        step(&mut progress, "Voxelizer/Sampler");

        let mut uniforms = render.uniform_pool("Voxelizer");
        let ubo = uniforms.get_buffer::<VoxelizerUbo>()?;
        let voxels_write = DescriptorWrite::StorageBuffer {
            binding: 1,
            buffer: voxels.handle(),
            offset: 0,
            range: voxels.size(),
        };

        let mut voxelize_pool = DescriptorPool::new(device.clone(), &voxelize_layout, 1)?;
        let voxelize_set = voxelize_pool.allocate(&[ubo.descriptor_write(0), voxels_write])?;
        step(&mut progress, "Voxelizer/Voxelize descriptors");
        let mut to_texture_pool = DescriptorPool::new(device.clone(), &to_texture_layout, 1)?;
        let to_texture_set = to_texture_pool.allocate(&[
            ubo.descriptor_write(0),
            voxels_write,
            DescriptorWrite::StorageImage {
                binding: 2,
                view: first_bounce.view(),
            },
        ])?;
        step(&mut progress, "Voxelizer/BufferToTexture descriptors");
        let mut bounce_pool = DescriptorPool::new(device.clone(), &bounce_layout, 1)?;
        let bounce_set = bounce_pool.allocate(&[
            ubo.descriptor_write(0),
            DescriptorWrite::SampledImage {
                binding: 1,
                array_element: 0,
                view: first_bounce.view(),
                sampler: sampler.handle(),
            },
            DescriptorWrite::StorageImage {
                binding: 2,
                view: second_bounce.view(),
            },
        ])?;
        step(&mut progress, "Voxelizer/SecondaryBounce descriptors");

        let shaders = render.shaders();
        let (vertex_bindings, vertex_attributes) = scene_vertex_input();
        let voxelize_pipeline = OwnedPipeline::graphics(
            device.clone(),
            &GraphicsPipelineConfig {
                vertex_shader: shaders.shader(shaders::VOXELIZE_VERT)?,
                geometry_shader: Some(shaders.shader(shaders::VOXELIZE_GEOM)?),
                fragment_shader: shaders.shader(shaders::VOXELIZE_FRAG)?,
                vertex_bindings,
                vertex_attributes,
                cull_mode: vk::CullModeFlags::NONE,
                depth_test: false,
                depth_write: false,
                color_formats: Vec::new(),
                depth_format: None,
                conservative_rasterization: conservative,
                ..GraphicsPipelineConfig::default()
            },
            &[voxelize_layout.handle()],
            &[],
        )?;
        step(&mut progress, "Voxelizer/Voxelize pipeline");
        let to_texture_pipeline = OwnedPipeline::compute(
            device.clone(),
            &shaders.shader(shaders::VOXEL_BUFFER_TO_TEXTURE)?,
            &[to_texture_layout.handle()],
            &[],
        )?;
        step(&mut progress, "Voxelizer/BufferToTexture pipeline");
        let bounce_pipeline = OwnedPipeline::compute(
            device.clone(),
            &shaders.shader(shaders::VOXEL_SECONDARY_BOUNCE)?,
            &[bounce_layout.handle()],
            &[],
        )?;
        step(&mut progress, "Voxelizer/SecondaryBounce pipeline");

        let secondary_bounce = EnabledFlag::new(config.enable_secondary_bounce);
        let groups = group_count(grid, LOCAL_SIZE);
        let mut graph = FrameGraph::new("Voxelizer")
            .with_frames_in_flight(render.config().frames_in_flight);
        let voxel_buffer = graph.add_buffer("Voxels");
        let first = graph.add_image("FirstBounce");
        let second = graph.add_image("SecondaryBounce");

        let voxel_bytes = voxels.size();
        graph.add_pass(
            PassDesc::new(
                "Voxelize",
                ScenePass::new(
                    voxelize_pipeline.get(),
                    voxelize_set,
                    vk::Extent2D {
                        width: grid,
                        height: grid,
                    },
                    geometry,
                )
                .before(PassStep::FillBuffer {
                    buffer: voxels.handle(),
                    offset: 0,
                    size: voxel_bytes,
                    data: 0,
                })
                .before(PassStep::buffer_written(
                    voxels.handle(),
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                ))
                .after(PassStep::buffer_written(
                    voxels.handle(),
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                )),
            )
            .writes(voxel_buffer)
            .wait_stage(vk::PipelineStageFlags::TRANSFER),
        );
        graph.add_pass(
            PassDesc::new(
                "BufferToTexture",
                ComputePass::new(to_texture_pipeline.get(), to_texture_set, [groups; 3]).before(
                    PassStep::transition(
                        first_bounce.image(),
                        first_bounce.full_range(),
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::GENERAL,
                    ),
                ),
            )
            .reads(voxel_buffer)
            .writes(first)
            .wait_stage(vk::PipelineStageFlags::COMPUTE_SHADER),
        );
        graph.add_pass(
            PassDesc::new(
                "FirstBounceMips",
                MipChainPass {
                    image: first_bounce.image(),
                    extent: first_bounce.extent(),
                    mip_levels: mips,
                    array_layers: 1,
                    initial_layout: vk::ImageLayout::GENERAL,
                    final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            )
            .reads(first)
            .writes(first)
            .wait_stage(vk::PipelineStageFlags::TRANSFER)
            .output_stage(vk::PipelineStageFlags::FRAGMENT_SHADER),
        );
        graph.add_pass(
            PassDesc::new(
                "SecondaryBounce",
                ComputePass::new(bounce_pipeline.get(), bounce_set, [groups; 3]).before(
                    PassStep::transition(
                        second_bounce.image(),
                        second_bounce.full_range(),
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::GENERAL,
                    ),
                ),
            )
            .reads(first)
            .writes(second)
            .wait_stage(vk::PipelineStageFlags::COMPUTE_SHADER)
            .enabled_if(secondary_bounce.callback()),
        );
        graph.add_pass(
            PassDesc::new(
                "SecondaryBounceMips",
                MipChainPass {
                    image: second_bounce.image(),
                    extent: second_bounce.extent(),
                    mip_levels: mips,
                    array_layers: 1,
                    initial_layout: vk::ImageLayout::GENERAL,
                    final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            )
            .reads(second)
            .writes(second)
            .wait_stage(vk::PipelineStageFlags::TRANSFER)
            .output_stage(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .enabled_if(secondary_bounce.callback()),
        );
        let graph = graph.compile(device)?;
        step(&mut progress, "Voxelizer/Graph");

        tracing::info!(
            grid,
            mips,
            conservative,
            secondary_bounce = config.enable_secondary_bounce,
            "Initialised voxelizer"
        );

        Ok(Self {
            graph,
            secondary_bounce,
            config,
            uniforms,
            ubo,
            ubo_data: VoxelizerUbo::default(),
            tracker: UpdateTracker::ready(),
            frame: 0,
            _pipelines: vec![voxelize_pipeline, to_texture_pipeline, bounce_pipeline],
            _pools: vec![voxelize_pool, to_texture_pool, bounce_pool],
            _layouts: vec![voxelize_layout, to_texture_layout, bounce_layout],
            _sampler: sampler,
            voxels,
            first_bounce,
            second_bounce,
        })
    }

    /// Upper bound of the GPU objects [`Voxelizer::new`] creates.
    pub const fn count_initialisation_steps() -> u32 {
        INITIALISATION_STEPS
    }

    /// Switch the secondary bounce on or off from the next frame.
    pub fn set_secondary_bounce(&mut self, enabled: bool) {
        self.config.enable_secondary_bounce = enabled;
        self.secondary_bounce.set(enabled);
    }

    pub fn ubo(&self) -> &VoxelizerUbo {
        &self.ubo_data
    }

    pub fn graph(&self) -> &RunnableGraph {
        &self.graph
    }

    /// The texture cone tracing reads: the secondary bounce when it runs.
    pub fn result(&self) -> &GpuImage {
        if self.secondary_bounce.get() {
            &self.second_bounce
        } else {
            &self.first_bounce
        }
    }
}

impl FrameComponent for Voxelizer {
    fn name(&self) -> &str {
        self.graph.name()
    }

    fn state(&self) -> ComponentState {
        self.tracker.state
    }

    fn update_cpu(&mut self, updater: &CpuUpdater<'_>) -> Result<()> {
        let bounds = updater.scene.scene_bounds();
        let (voxel_size, center) =
            grid_placement(&self.config, bounds.max_dimension(), updater.camera.position);
        self.ubo_data = VoxelizerUbo {
            center_voxel_size: center.extend(voxel_size).to_array(),
            grid: [
                self.config.grid_size,
                self.config.num_cones,
                u32::from(self.config.enable_secondary_bounce),
                u32::from(self.config.enable_temporal_smoothing),
            ],
            cone_params: [
                self.config.max_distance,
                self.config.ray_step_size,
                self.config.voxel_size_factor,
                0.0,
            ],
        };
        self.frame = updater.frame;
        self.tracker.cpu_updated(updater.frame);
        Ok(())
    }

    fn update_gpu(&mut self, updater: &GpuUpdater) -> Result<()> {
        self.tracker.check_gpu_update(self.graph.name(), updater.frame)?;
        self.uniforms.write(&self.ubo, &self.ubo_data)?;
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
        visitor.visit_buffer(name, "Voxels", self.voxels.handle());
        visitor.visit_image(name, "FirstBounce", self.first_bounce.image());
        visitor.visit_image(name, "SecondaryBounce", self.second_bounce.image());
    }

    fn count_initialisation_steps(&self) -> u32 {
        INITIALISATION_STEPS
    }
}
