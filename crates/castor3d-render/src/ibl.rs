//! Image-based lighting textures.
//!
//! The BRDF lookup table depends on nothing but its size and is computed
//! once. Radiance and the prefiltered environment are recomputed from a
//! source cube map whenever [`IblTextures::update`] is called. All of it runs
//! as blocking one-shot submissions, never on the per-frame path.

use crate::component::{step, ProgressBar, RenderTechniqueVisitor};
use crate::graph::{RecordContext, RunnablePass};
use crate::passes::{group_count, push_range, ComputePass, OwnedPipeline, PassStep};
use crate::render_device::RenderDevice;
use crate::shaders;
use castor3d_core::IblConfig;
use castor3d_gpu::{
    execute_single_time_commands, vk, DescriptorPool, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorWrite, Device, GpuImage, ImageDesc, QueueKind, Result,
    Sampler, SamplerDesc,
};
use std::sync::Arc;

pub const BRDF_FORMAT: vk::Format = vk::Format::R16G16_SFLOAT;
pub const CUBE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
const LOCAL_SIZE: u32 = 8;

/// Layouts, pools, pipelines, images, sampler and the LUT computation.
const INITIALISATION_STEPS: u32 = 12;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct PrefilterConstants {
    roughness: f32,
    mip_level: u32,
}

/// Roughness a prefiltered mip level is convolved for.
pub fn mip_roughness(level: u32, levels: u32) -> f32 {
    if levels <= 1 {
        0.0
    } else {
        level as f32 / (levels - 1) as f32
    }
}

/// BRDF LUT, radiance and prefiltered environment textures.
pub struct IblTextures {
    device: Arc<dyn Device>,
    queue: QueueKind,
    config: IblConfig,
    brdf: GpuImage,
    radiance: GpuImage,
    prefiltered: GpuImage,
    /// Storage views of each prefiltered mip, as six-layer arrays.
    prefiltered_mips: Vec<vk::ImageView>,
    sampler: Sampler,
    filter_pool: DescriptorPool,
    /// Sets bound to the last source; freed before the next update.
    filter_sets: Vec<vk::DescriptorSet>,
    radiance_pipeline: OwnedPipeline,
    prefilter_pipeline: OwnedPipeline,
    _brdf_pipeline: OwnedPipeline,
    _brdf_pool: DescriptorPool,
    _brdf_layout: DescriptorSetLayout,
    _filter_layout: DescriptorSetLayout,
    updates: u64,
}

impl IblTextures {
    pub fn new(
        render: &RenderDevice,
        queue: QueueKind,
        mut progress: Option<&mut dyn ProgressBar>,
    ) -> Result<Self> {
        let device = render.device().clone();
        let config = render.config().ibl.clone();
        let prefiltered_mips = config.prefiltered_mip_levels();

        let brdf_layout = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .build(device.clone())?;
        step(&mut progress, "IblTextures/BRDF layout");
        let filter_layout = DescriptorSetLayoutBuilder::new()
            .sampled_images(0, 1, vk::ShaderStageFlags::COMPUTE)
            .storage_image(1, vk::ShaderStageFlags::COMPUTE)
            .build(device.clone())?;
        step(&mut progress, "IblTextures/Filter layout");

        let brdf = GpuImage::new(
            device.clone(),
            &ImageDesc::new_2d("IblTextures/BRDF", BRDF_FORMAT, config.brdf_size, config.brdf_size)
                .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED),
            vk::ImageViewType::TYPE_2D,
        )?;
        step(&mut progress, "IblTextures/BRDF");
        let cube_usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED;
        let mut radiance = GpuImage::new(
            device.clone(),
            &ImageDesc::new_cube("IblTextures/Radiance", CUBE_FORMAT, config.radiance_size)
                .usage(cube_usage),
            vk::ImageViewType::CUBE,
        )?;
        step(&mut progress, "IblTextures/Radiance");
        let mut prefiltered = GpuImage::new(
            device.clone(),
            &ImageDesc::new_cube("IblTextures/Prefiltered", CUBE_FORMAT, config.prefiltered_size)
                .mip_levels(prefiltered_mips)
                .usage(cube_usage),
            vk::ImageViewType::CUBE,
        )?;
        let mut mip_views = Vec::with_capacity(prefiltered_mips as usize + 1);
        mip_views.push(radiance.sub_view(vk::ImageViewType::TYPE_2D_ARRAY, 0, 0, 6)?);
        for level in 0..prefiltered_mips {
            mip_views.push(prefiltered.sub_view(vk::ImageViewType::TYPE_2D_ARRAY, level, 0, 6)?);
        }
        step(&mut progress, "IblTextures/Prefiltered");
        let sampler = Sampler::new(device.clone(), &SamplerDesc::default())?;
        step(&mut progress, "IblTextures/Sampler");

        let mut brdf_pool = DescriptorPool::new(device.clone(), &brdf_layout, 1)?;
        let brdf_set = brdf_pool.allocate(&[DescriptorWrite::StorageImage {
            binding: 0,
            view: brdf.view(),
        }])?;
        step(&mut progress, "IblTextures/BRDF descriptors");
        // Radiance plus one set per prefiltered mip.
        let filter_pool = DescriptorPool::new(device.clone(), &filter_layout, prefiltered_mips + 1)?;
        step(&mut progress, "IblTextures/Filter descriptors");

        let shaders = render.shaders();
        let brdf_pipeline = OwnedPipeline::compute(
            device.clone(),
            &shaders.shader(shaders::BRDF_LUT)?,
            &[brdf_layout.handle()],
            &[],
        )?;
        step(&mut progress, "IblTextures/BRDF pipeline");
        let radiance_pipeline = OwnedPipeline::compute(
            device.clone(),
            &shaders.shader(shaders::RADIANCE)?,
            &[filter_layout.handle()],
            &[],
        )?;
        step(&mut progress, "IblTextures/Radiance pipeline");
        let prefilter_pipeline = OwnedPipeline::compute(
            device.clone(),
            &shaders.shader(shaders::PREFILTER)?,
            &[filter_layout.handle()],
            &[push_range(
                vk::ShaderStageFlags::COMPUTE,
                std::mem::size_of::<PrefilterConstants>(),
            )],
        )?;
        step(&mut progress, "IblTextures/Prefilter pipeline");

        let size = config.brdf_size;
        let mut lut = ComputePass::new(
            brdf_pipeline.get(),
            brdf_set,
            [group_count(size, LOCAL_SIZE), group_count(size, LOCAL_SIZE), 1],
        )
        .before(PassStep::transition(
            brdf.image(),
            brdf.full_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        ))
        .after(PassStep::transition(
            brdf.image(),
            brdf.full_range(),
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        record_once(device.as_ref(), queue, "IblTextures/BRDF", &mut lut)?;
        step(&mut progress, "IblTextures/BRDF computed");

        tracing::info!(
            brdf = config.brdf_size,
            radiance = config.radiance_size,
            prefiltered = config.prefiltered_size,
            mips = prefiltered_mips,
            "Initialised IBL textures"
        );

        Ok(Self {
            device,
            queue,
            config,
            brdf,
            radiance,
            prefiltered,
            prefiltered_mips: mip_views,
            sampler,
            filter_pool,
            filter_sets: Vec::new(),
            radiance_pipeline,
            prefilter_pipeline,
            _brdf_pipeline: brdf_pipeline,
            _brdf_pool: brdf_pool,
            _brdf_layout: brdf_layout,
            _filter_layout: filter_layout,
            updates: 0,
        })
    }

    pub const fn count_initialisation_steps() -> u32 {
        INITIALISATION_STEPS
    }

    /// Recompute radiance and the prefiltered mips from `source`, a sampled cube view.
    ///
    /// Blocks until the GPU finished.
    pub fn update(&mut self, source: vk::ImageView) -> Result<()> {
        for set in self.filter_sets.drain(..) {
            self.filter_pool.free(set)?;
        }
        let mut passes = Vec::with_capacity(self.prefiltered_mips.len());
        for (index, &target) in self.prefiltered_mips.iter().enumerate() {
            let set = self.filter_pool.allocate(&[
                DescriptorWrite::SampledImage {
                    binding: 0,
                    array_element: 0,
                    view: source,
                    sampler: self.sampler.handle(),
                },
                DescriptorWrite::StorageImage {
                    binding: 1,
                    view: target,
                },
            ])?;
            self.filter_sets.push(set);
            passes.push(if index == 0 {
                self.radiance_pass(set)
            } else {
                self.prefilter_pass(set, index as u32 - 1)
            });
        }

        let device = self.device.clone();
        execute_single_time_commands(device.as_ref(), self.queue, |cb| {
            let mut ctx = RecordContext {
                device: device.as_ref(),
                command_buffer: cb,
                frame: self.updates,
                pass_name: "IblTextures/Filter",
            };
            for pass in &mut passes {
                pass.record(&mut ctx)?;
            }
            Ok(())
        })?;
        self.updates += 1;
        tracing::debug!(updates = self.updates, "Updated IBL textures");
        Ok(())
    }

    fn radiance_pass(&self, set: vk::DescriptorSet) -> ComputePass {
        let size = self.config.radiance_size;
        let range = self.radiance.full_range();
        ComputePass::new(
            self.radiance_pipeline.get(),
            set,
            [group_count(size, LOCAL_SIZE), group_count(size, LOCAL_SIZE), 6],
        )
        .before(PassStep::transition(
            self.radiance.image(),
            range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        ))
        .after(PassStep::transition(
            self.radiance.image(),
            range,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ))
    }

    fn prefilter_pass(&self, set: vk::DescriptorSet, level: u32) -> ComputePass {
        let extent = self.prefiltered.mip_extent(level);
        let range = self.prefiltered.sub_range(level, 0, 6);
        ComputePass::new(
            self.prefilter_pipeline.get(),
            set,
            [
                group_count(extent.width, LOCAL_SIZE),
                group_count(extent.height, LOCAL_SIZE),
                6,
            ],
        )
        .with_push_constants(&PrefilterConstants {
            roughness: mip_roughness(level, self.prefiltered.mip_levels()),
            mip_level: level,
        })
        .before(PassStep::transition(
            self.prefiltered.image(),
            range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        ))
        .after(PassStep::transition(
            self.prefiltered.image(),
            range,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ))
    }

    pub fn brdf(&self) -> &GpuImage {
        &self.brdf
    }

    pub fn radiance(&self) -> &GpuImage {
        &self.radiance
    }

    pub fn prefiltered(&self) -> &GpuImage {
        &self.prefiltered
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    /// Number of completed [`IblTextures::update`] calls.
    pub fn update_count(&self) -> u64 {
        self.updates
    }

    pub fn accept(&self, visitor: &mut dyn RenderTechniqueVisitor) {
        visitor.visit_image("IblTextures", "BRDF", self.brdf.image());
        visitor.visit_image("IblTextures", "Radiance", self.radiance.image());
        visitor.visit_image("IblTextures", "Prefiltered", self.prefiltered.image());
    }
}

fn record_once(
    device: &dyn Device,
    queue: QueueKind,
    name: &str,
    pass: &mut dyn RunnablePass,
) -> Result<()> {
    execute_single_time_commands(device, queue, |cb| {
        pass.record(&mut RecordContext {
            device,
            command_buffer: cb,
            frame: 0,
            pass_name: name,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn roughness_spans_the_mip_chain() {
        assert_relative_eq!(mip_roughness(0, 8), 0.0);
        assert_relative_eq!(mip_roughness(7, 8), 1.0);
        assert_relative_eq!(mip_roughness(3, 8), 3.0 / 7.0);
        assert_relative_eq!(mip_roughness(0, 1), 0.0);
    }
}
