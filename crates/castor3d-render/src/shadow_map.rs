//! Shadow maps for one light type.
//!
//! Each shadow-casting light of the type gets a slot. A slot owns one frame
//! graph with a depth pass per layer (cascade, cube face or single spot
//! view), optionally followed by a variance blur of the slot's layers.

use crate::camera::Camera;
use crate::component::{
    step, visit_graph, ComponentState, CpuUpdater, FrameComponent, GpuUpdater, ProgressBar,
    RenderTechniqueVisitor, UpdateTracker,
};
use crate::environment_map::face_views;
use crate::graph::{FrameGraph, PassDesc, RunnableGraph};
use crate::passes::{
    group_count, push_range, ComputePass, OwnedPipeline, PassStep, ScenePass,
};
use crate::render_device::RenderDevice;
use crate::scene::{scene_vertex_input, LightData, LightKind, SceneGeometry};
use crate::shaders;
use castor3d_core::ShadowConfig;
use castor3d_gpu::{
    vk, ColorAttachment, DepthAttachment, DescriptorPool, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorWrite, GpuError, GpuImage, GraphicsPipelineConfig,
    ImageDesc, QueueKind, Result, Sampler, SamplerDesc, SemaphoreRelay, SemaphoreWait,
    SemaphoreWaitArray, UniformBufferOffset, UniformBufferPool,
};
use glam::{Mat4, Vec3};
use std::sync::Arc;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const VARIANCE_FORMAT: vk::Format = vk::Format::R32G32_SFLOAT;
const NEAR: f32 = 0.1;
/// Weight of the logarithmic split against the uniform one.
const CASCADE_LAMBDA: f32 = 0.75;
const BLUR_LOCAL_SIZE: u32 = 8;

/// Light matrices of one shadow map layer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowUbo {
    pub view_projection: [[f32; 4]; 4],
    /// Light position, range in `w`.
    pub position_range: [f32; 4],
    /// Far distance of the cascade, directional lights only.
    pub split: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurConstants {
    base_layer: u32,
}

/// Number of slots configured for `kind`.
pub fn slot_count(config: &ShadowConfig, kind: LightKind) -> u32 {
    match kind {
        LightKind::Directional => config.max_directional_lights,
        LightKind::Point => config.max_point_lights,
        LightKind::Spot => config.max_spot_lights,
    }
}

/// Depth layers one slot renders.
pub fn layers_per_slot(config: &ShadowConfig, kind: LightKind) -> u32 {
    match kind {
        LightKind::Directional => config.directional_cascades,
        LightKind::Point => 6,
        LightKind::Spot => 1,
    }
}

/// Shadow-casting lights of `kind`, nearest to `camera` first, at most `count`.
///
/// Lights at equal distance keep their scene order.
pub fn assign_lights(lights: &[LightData], kind: LightKind, camera: Vec3, count: usize) -> Vec<LightData> {
    let mut candidates: Vec<LightData> = lights
        .iter()
        .filter(|light| light.kind == kind && light.casts_shadows)
        .copied()
        .collect();
    if kind != LightKind::Directional {
        candidates.sort_by(|a, b| {
            a.position
                .distance_squared(camera)
                .total_cmp(&b.position.distance_squared(camera))
        });
    }
    candidates.truncate(count);
    candidates
}

/// Far distance of each cascade, blending logarithmic and uniform splits.
pub fn cascade_splits(near: f32, far: f32, count: u32, lambda: f32) -> Vec<f32> {
    (1..=count)
        .map(|index| {
            let ratio = index as f32 / count as f32;
            let log = near * (far / near).powf(ratio);
            let uniform = near + (far - near) * ratio;
            lambda * log + (1.0 - lambda) * uniform
        })
        .collect()
}

fn light_up(direction: Vec3) -> Vec3 {
    if direction.cross(Vec3::Y).length_squared() < 1.0e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

/// Orthographic light matrix enclosing the camera frustum between `near` and `far`.
fn cascade_matrix(camera: &Camera, direction: Vec3, near: f32, far: f32) -> Mat4 {
    let inverse_view = camera.view_matrix().inverse();
    let tan = (camera.fov * 0.5).tan();
    let mut corners = Vec::with_capacity(8);
    for distance in [near, far] {
        let height = distance * tan;
        let width = height * camera.aspect;
        for (x, y) in [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)] {
            corners.push(
                inverse_view.transform_point3(Vec3::new(x * width, y * height, -distance)),
            );
        }
    }
    let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
    let radius = corners
        .iter()
        .map(|corner| corner.distance(center))
        .fold(0.0f32, f32::max)
        .max(NEAR);
    let view = Mat4::look_to_rh(center - direction * radius, direction, light_up(direction));
    let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 2.0 * radius);
    projection * view
}

/// Layer matrices of `light` seen from `camera`.
pub fn light_layers(light: &LightData, camera: &Camera, cascades: u32) -> Vec<ShadowUbo> {
    let position_range = light.position.extend(light.range.min(f32::MAX)).to_array();
    match light.kind {
        LightKind::Directional => {
            let splits = cascade_splits(camera.near, camera.far, cascades, CASCADE_LAMBDA);
            let mut near = camera.near;
            splits
                .into_iter()
                .map(|far| {
                    let matrix = cascade_matrix(camera, light.direction, near, far);
                    near = far;
                    ShadowUbo {
                        view_projection: matrix.to_cols_array_2d(),
                        position_range,
                        split: [far, 0.0, 0.0, 0.0],
                    }
                })
                .collect()
        }
        LightKind::Point => {
            let projection =
                Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, NEAR, light.range.max(NEAR * 2.0));
            face_views(light.position)
                .into_iter()
                .map(|view| ShadowUbo {
                    view_projection: (projection * view).to_cols_array_2d(),
                    position_range,
                    split: [0.0; 4],
                })
                .collect()
        }
        LightKind::Spot => {
            let projection = Mat4::perspective_rh(
                light.cone_angle.clamp(0.01, std::f32::consts::PI - 0.01),
                1.0,
                NEAR,
                light.range.max(NEAR * 2.0),
            );
            let view = Mat4::look_to_rh(light.position, light.direction, light_up(light.direction));
            vec![ShadowUbo {
                view_projection: (projection * view).to_cols_array_2d(),
                position_range,
                split: [0.0; 4],
            }]
        }
    }
}

/// Variance targets and the blur that filters them.
struct BlurResources {
    set: vk::DescriptorSet,
    pipeline: OwnedPipeline,
    _pool: DescriptorPool,
    _layout: DescriptorSetLayout,
    _sampler: Sampler,
    variance: GpuImage,
    blurred: GpuImage,
}

impl BlurResources {
    fn new(
        render: &RenderDevice,
        name: &str,
        size: u32,
        total_layers: u32,
        progress: &mut Option<&mut dyn ProgressBar>,
    ) -> Result<Self> {
        let device = render.device().clone();
        let variance = GpuImage::new(
            device.clone(),
            &ImageDesc::new_2d(&format!("{name}/Variance"), VARIANCE_FORMAT, size, size)
                .array_layers(total_layers)
                .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED),
            vk::ImageViewType::TYPE_2D_ARRAY,
        )?;
        step(progress, "ShadowMap variance");
        let blurred = GpuImage::new(
            device.clone(),
            &ImageDesc::new_2d(&format!("{name}/Blurred"), VARIANCE_FORMAT, size, size)
                .array_layers(total_layers)
                .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED),
            vk::ImageViewType::TYPE_2D_ARRAY,
        )?;
        step(progress, "ShadowMap blurred");
        let sampler = Sampler::new(device.clone(), &SamplerDesc::default())?;
        step(progress, "ShadowMap sampler");
        let layout = DescriptorSetLayoutBuilder::new()
            .sampled_images(0, 1, vk::ShaderStageFlags::COMPUTE)
            .storage_image(1, vk::ShaderStageFlags::COMPUTE)
            .build(device.clone())?;
        step(progress, "ShadowMap blur layout");
        let mut pool = DescriptorPool::new(device.clone(), &layout, 1)?;
        let set = pool.allocate(&[
            DescriptorWrite::SampledImage {
                binding: 0,
                array_element: 0,
                view: variance.view(),
                sampler: sampler.handle(),
            },
            DescriptorWrite::StorageImage {
                binding: 1,
                view: blurred.view(),
            },
        ])?;
        step(progress, "ShadowMap blur descriptors");
        let pipeline = OwnedPipeline::compute(
            device,
            &render.shaders().shader(shaders::SHADOW_BLUR)?,
            &[layout.handle()],
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                std::mem::size_of::<BlurConstants>(),
            )],
        )?;
        step(progress, "ShadowMap blur pipeline");
        Ok(Self {
            set,
            pipeline,
            _pool: pool,
            _layout: layout,
            _sampler: sampler,
            variance,
            blurred,
        })
    }

    /// Blur of the `layers` layers starting at `first_layer`.
    fn pass(&self, size: u32, first_layer: u32, layers: u32) -> ComputePass {
        let range = self.blurred.sub_range(0, first_layer, layers);
        ComputePass::new(
            self.pipeline.get(),
            self.set,
            [
                group_count(size, BLUR_LOCAL_SIZE),
                group_count(size, BLUR_LOCAL_SIZE),
                layers,
            ],
        )
        .with_push_constants(&BlurConstants {
            base_layer: first_layer,
        })
        .before(PassStep::transition(
            self.blurred.image(),
            range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        ))
        .after(PassStep::transition(
            self.blurred.image(),
            range,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ))
    }
}

/// Shadow maps of every light of one type.
pub struct ShadowMap {
    kind: LightKind,
    config: ShadowConfig,
    graphs: Vec<RunnableGraph>,
    /// Hands the caller's waits to every slot.
    relay: SemaphoreRelay,
    uniforms: UniformBufferPool,
    /// One UBO per layer of each slot.
    layer_ubos: Vec<Vec<UniformBufferOffset<ShadowUbo>>>,
    layer_data: Vec<Vec<ShadowUbo>>,
    assigned: Vec<LightData>,
    tracker: UpdateTracker,
    frame: u64,
    _pipeline: OwnedPipeline,
    _pool: DescriptorPool,
    _layout: DescriptorSetLayout,
    blur: Option<BlurResources>,
    depth: GpuImage,
}

impl ShadowMap {
    pub fn new(
        render: &RenderDevice,
        kind: LightKind,
        geometry: Arc<dyn SceneGeometry>,
        mut progress: Option<&mut dyn ProgressBar>,
    ) -> Result<Self> {
        let device = render.device().clone();
        let config = render.config().shadows.clone();
        let slots = slot_count(&config, kind);
        if slots == 0 {
            return Err(GpuError::InvalidState(format!(
                "no {kind:?} shadow map slots configured"
            )));
        }
        let layers = layers_per_slot(&config, kind);
        let total_layers = slots * layers;
        let size = config.map_size;
        let name = format!("ShadowMap{kind:?}");

        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(device.clone())?;
        step(&mut progress, "ShadowMap layout");
        let mut depth = GpuImage::new(
            device.clone(),
            &ImageDesc::new_2d(&format!("{name}/Depth"), DEPTH_FORMAT, size, size)
                .array_layers(total_layers)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED),
            vk::ImageViewType::TYPE_2D_ARRAY,
        )?;
        step(&mut progress, "ShadowMap depth");

        let mut uniforms = render.uniform_pool(&name);
        let mut pool = DescriptorPool::new(device.clone(), &layout, total_layers)?;
        let mut layer_ubos = Vec::with_capacity(slots as usize);
        let mut layer_sets = Vec::with_capacity(slots as usize);
        for _ in 0..slots {
            let mut ubos = Vec::with_capacity(layers as usize);
            let mut sets = Vec::with_capacity(layers as usize);
            for _ in 0..layers {
                let ubo = uniforms.get_buffer::<ShadowUbo>()?;
                sets.push(pool.allocate(&[ubo.descriptor_write(0)])?);
                ubos.push(ubo);
            }
            layer_ubos.push(ubos);
            layer_sets.push(sets);
        }
        step(&mut progress, "ShadowMap descriptors");

        let mut blur = if config.enable_blur {
            Some(BlurResources::new(render, &name, size, total_layers, &mut progress)?)
        } else {
            None
        };

        let shaders = render.shaders();
        let (vertex_bindings, vertex_attributes) = scene_vertex_input();
        let mut pipeline_config = GraphicsPipelineConfig {
            vertex_shader: shaders.shader(shaders::SHADOW_VERT)?,
            fragment_shader: shaders.shader(shaders::SHADOW_FRAG)?,
            vertex_bindings,
            vertex_attributes,
            ..GraphicsPipelineConfig::depth_only(DEPTH_FORMAT)
        };
        if blur.is_some() {
            pipeline_config.color_formats = vec![VARIANCE_FORMAT];
        }
        let pipeline =
            OwnedPipeline::graphics(device.clone(), &pipeline_config, &[layout.handle()], &[])?;
        step(&mut progress, "ShadowMap pipeline");

        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        let mut graphs = Vec::with_capacity(slots as usize);
        for (slot, sets) in (0u32..).zip(&layer_sets) {
            let first_layer = slot * layers;
            let mut graph = FrameGraph::new(format!("{name}{slot}"))
                .with_frames_in_flight(render.config().frames_in_flight);
            let mut layer_resources = Vec::with_capacity(sets.len());
            for (layer, &set) in (0u32..).zip(sets) {
                let layer_index = first_layer + layer;
                let resource = graph.add_image(format!("Layer{layer}"));
                layer_resources.push(resource);
                let depth_view = depth.sub_view(vk::ImageViewType::TYPE_2D, 0, layer_index, 1)?;
                let mut pass = ScenePass::new(pipeline.get(), set, extent, geometry.clone())
                    .depth(DepthAttachment {
                        view: depth_view,
                        clear: Some(1.0),
                    })
                    .before(PassStep::transition(
                        depth.image(),
                        depth.sub_range(0, layer_index, 1),
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                    ))
                    .after(PassStep::transition(
                        depth.image(),
                        depth.sub_range(0, layer_index, 1),
                        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    ));
                if let Some(blur) = blur.as_mut() {
                    let range = blur.variance.sub_range(0, layer_index, 1);
                    let view = blur
                        .variance
                        .sub_view(vk::ImageViewType::TYPE_2D, 0, layer_index, 1)?;
                    pass = pass
                        .color(ColorAttachment {
                            view,
                            clear: Some([1.0, 1.0, 0.0, 0.0]),
                        })
                        .before(PassStep::transition(
                            blur.variance.image(),
                            range,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        ))
                        .after(PassStep::transition(
                            blur.variance.image(),
                            range,
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        ));
                }
                graph.add_pass(
                    PassDesc::new(format!("Layer{layer}"), pass)
                        .writes(resource)
                        .wait_stage(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
                        .output_stage(vk::PipelineStageFlags::FRAGMENT_SHADER),
                );
            }
            if let Some(blur) = &blur {
                let blurred = graph.add_image("Blurred");
                let mut desc = PassDesc::new("Blur", blur.pass(size, first_layer, layers))
                    .writes(blurred)
                    .wait_stage(vk::PipelineStageFlags::COMPUTE_SHADER)
                    .output_stage(vk::PipelineStageFlags::FRAGMENT_SHADER);
                for &resource in &layer_resources {
                    desc = desc.reads(resource);
                }
                graph.add_pass(desc);
            }
            graphs.push(graph.compile(device.clone())?);
            step(&mut progress, "ShadowMap graph");
        }

        tracing::info!(
            kind = ?kind,
            slots,
            layers,
            size,
            blur = config.enable_blur,
            "Initialised shadow map"
        );

        Ok(Self {
            kind,
            layer_data: vec![vec![ShadowUbo::default(); layers as usize]; slots as usize],
            config,
            graphs,
            relay: SemaphoreRelay::new(render.device().clone(), name),
            uniforms,
            layer_ubos,
            assigned: Vec::new(),
            tracker: UpdateTracker::ready(),
            frame: 0,
            _pipeline: pipeline,
            _pool: pool,
            _layout: layout,
            blur,
            depth,
        })
    }

    /// Upper bound of the GPU objects [`ShadowMap::new`] creates.
    pub fn count_initialisation_steps_for(config: &ShadowConfig, kind: LightKind) -> u32 {
        let blur = if config.enable_blur { 6 } else { 0 };
        4 + blur + slot_count(config, kind)
    }

    pub fn kind(&self) -> LightKind {
        self.kind
    }

    pub fn slot_count(&self) -> usize {
        self.graphs.len()
    }

    /// Lights holding a slot this frame, slot `i` first.
    pub fn assigned_lights(&self) -> &[LightData] {
        &self.assigned
    }

    pub fn layer_data(&self, slot: usize) -> Option<&[ShadowUbo]> {
        self.layer_data.get(slot).map(Vec::as_slice)
    }

    pub fn graph(&self, slot: usize) -> Option<&RunnableGraph> {
        self.graphs.get(slot)
    }

    pub fn depth(&self) -> &GpuImage {
        &self.depth
    }

    /// Run the graph of slot `index` after `to_wait`.
    pub fn render_slot(
        &mut self,
        to_wait: &[SemaphoreWait],
        queue: QueueKind,
        index: usize,
    ) -> Result<SemaphoreWaitArray> {
        let frame = self.frame;
        let count = self.graphs.len();
        let graph = self.graphs.get_mut(index).ok_or_else(|| {
            GpuError::InvalidHandle(format!("shadow map slot {index} of {count}"))
        })?;
        graph.run(to_wait, queue, frame)
    }
}

impl FrameComponent for ShadowMap {
    fn name(&self) -> &str {
        match self.kind {
            LightKind::Directional => "ShadowMapDirectional",
            LightKind::Point => "ShadowMapPoint",
            LightKind::Spot => "ShadowMapSpot",
        }
    }

    fn state(&self) -> ComponentState {
        self.tracker.state
    }

    fn update_cpu(&mut self, updater: &CpuUpdater<'_>) -> Result<()> {
        self.assigned = assign_lights(
            updater.scene.lights(),
            self.kind,
            updater.camera.position,
            self.graphs.len(),
        );
        for (slot, light) in self.assigned.iter().enumerate() {
            self.layer_data[slot] =
                light_layers(light, updater.camera, self.config.directional_cascades);
        }
        self.frame = updater.frame;
        self.tracker.cpu_updated(updater.frame);
        Ok(())
    }

    fn update_gpu(&mut self, updater: &GpuUpdater) -> Result<()> {
        self.tracker.check_gpu_update(self.name(), updater.frame)?;
        for slot in 0..self.assigned.len() {
            for (ubo, data) in self.layer_ubos[slot].iter().zip(&self.layer_data[slot]) {
                self.uniforms.write(ubo, data)?;
            }
        }
        if let Some(cb) = updater.upload {
            self.uniforms.upload(cb)?;
        }
        Ok(())
    }

    /// Run the slot of every assigned light. Slots write disjoint layers, so
    /// they all start from `to_wait` and their waits are merged.
    fn render(&mut self, to_wait: &[SemaphoreWait], queue: QueueKind) -> Result<SemaphoreWaitArray> {
        let count = self.assigned.len();
        let mut waits = if count == 0 {
            to_wait.to_vec()
        } else {
            SemaphoreWaitArray::new()
        };
        let inputs = self.relay.split(to_wait, queue, count)?;
        for (index, input) in inputs.iter().enumerate() {
            waits.extend(self.render_slot(input, queue, index)?);
        }
        self.tracker.rendered();
        Ok(waits)
    }

    fn accept(&self, visitor: &mut dyn RenderTechniqueVisitor) {
        let name = self.name();
        for graph in &self.graphs {
            visit_graph(name, graph, visitor);
        }
        visitor.visit_image(name, "Depth", self.depth.image());
        if let Some(blur) = &self.blur {
            visitor.visit_image(name, "Variance", blur.variance.image());
            visitor.visit_image(name, "Blurred", blur.blurred.image());
        }
    }

    fn count_initialisation_steps(&self) -> u32 {
        Self::count_initialisation_steps_for(&self.config, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn nearest_lights_get_the_slots() {
        let lights = [
            LightData::point(1, Vec3::new(10.0, 0.0, 0.0), 5.0),
            LightData::spot(2, Vec3::ZERO, Vec3::NEG_Y, 5.0, 1.0),
            LightData::point(3, Vec3::new(2.0, 0.0, 0.0), 5.0),
            LightData {
                casts_shadows: false,
                ..LightData::point(4, Vec3::ZERO, 5.0)
            },
            LightData::point(5, Vec3::new(-2.0, 0.0, 0.0), 5.0),
        ];
        let assigned = assign_lights(&lights, LightKind::Point, Vec3::ZERO, 2);
        let ids: Vec<u64> = assigned.iter().map(|light| light.id).collect();
        // 3 and 5 tie; scene order decides.
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn splits_end_at_the_far_plane() {
        let splits = cascade_splits(0.1, 100.0, 4, CASCADE_LAMBDA);
        assert_eq!(splits.len(), 4);
        assert!(splits.windows(2).all(|pair| pair[0] < pair[1]));
        assert_relative_eq!(splits[3], 100.0, epsilon = 1e-3);
    }

    #[test]
    fn layer_count_follows_the_light_type() {
        let camera = Camera::default();
        let directional = LightData::directional(0, Vec3::new(0.0, -1.0, -1.0));
        assert_eq!(light_layers(&directional, &camera, 3).len(), 3);
        let point = LightData::point(1, Vec3::ONE, 10.0);
        assert_eq!(light_layers(&point, &camera, 3).len(), 6);
        let spot = LightData::spot(2, Vec3::ONE, Vec3::NEG_Y, 10.0, 0.8);
        assert_eq!(light_layers(&spot, &camera, 3).len(), 1);
    }
}
