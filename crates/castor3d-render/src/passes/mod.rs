//! Reusable pass bodies recorded by the frame graphs.
//!
//! A pass only holds handles. The pipelines, descriptor sets and images it
//! records against are owned by the component that built the graph.

mod compute;
mod mip_chain;
mod scene_pass;

pub use compute::{group_count, ComputePass};
pub use mip_chain::MipChainPass;
pub use scene_pass::ScenePass;

use castor3d_gpu::{
    vk, BufferBarrier, BufferDesc, Device, GraphicsPipelineConfig, ImageBarrier, Pipeline, Result,
};
use std::sync::Arc;

/// A command recorded around a pass body.
#[derive(Debug, Clone, Copy)]
pub enum PassStep {
    ImageBarrier(ImageBarrier),
    BufferBarrier(BufferBarrier),
    FillBuffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
}

impl PassStep {
    pub fn record(&self, device: &dyn Device, cb: vk::CommandBuffer) {
        match self {
            Self::ImageBarrier(barrier) => device.cmd_image_barrier(cb, barrier),
            Self::BufferBarrier(barrier) => device.cmd_buffer_barrier(cb, barrier),
            Self::FillBuffer {
                buffer,
                offset,
                size,
                data,
            } => device.cmd_fill_buffer(cb, *buffer, *offset, *size, *data),
        }
    }

    /// Transition `range` of `image` from `old` to `new`.
    pub fn transition(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Self {
        let (src_stage, src_access) = layout_usage(old);
        let (dst_stage, dst_access) = layout_usage(new);
        Self::ImageBarrier(ImageBarrier {
            image,
            range,
            old_layout: old,
            new_layout: new,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        })
    }

    /// Make compute-shader writes to `buffer` visible to `dst_stage`.
    pub fn buffer_written(
        buffer: vk::Buffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Self {
        Self::BufferBarrier(BufferBarrier {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_stage,
            src_access: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
            dst_stage,
            dst_access: vk::AccessFlags::SHADER_READ,
        })
    }
}

/// Stage and access a layout is typically used with.
fn layout_usage(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ),
        _ => (
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
    }
}

/// Record each step in order.
pub(crate) fn record_steps(steps: &[PassStep], device: &dyn Device, cb: vk::CommandBuffer) {
    for step in steps {
        step.record(device, cb);
    }
}

/// A pipeline destroyed with its owner.
pub struct OwnedPipeline {
    device: Arc<dyn Device>,
    pipeline: Pipeline,
}

impl OwnedPipeline {
    pub fn compute(
        device: Arc<dyn Device>,
        shader: &[u32],
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let pipeline = device.create_compute_pipeline(shader, set_layouts, push_constants)?;
        Ok(Self { device, pipeline })
    }

    pub fn graphics(
        device: Arc<dyn Device>,
        config: &GraphicsPipelineConfig,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let pipeline = device.create_graphics_pipeline(config, set_layouts, push_constants)?;
        Ok(Self { device, pipeline })
    }

    pub const fn get(&self) -> Pipeline {
        self.pipeline
    }
}

impl Drop for OwnedPipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(&self.pipeline);
    }
}

/// A plain buffer destroyed with its owner.
///
/// Used for storage the GPU fills itself, which needs no host-side copy.
pub struct OwnedBuffer {
    device: Arc<dyn Device>,
    buffer: vk::Buffer,
    size: u64,
}

impl OwnedBuffer {
    pub fn new(device: Arc<dyn Device>, desc: &BufferDesc<'_>) -> Result<Self> {
        let buffer = device.create_buffer(desc)?;
        Ok(Self {
            device,
            buffer,
            size: desc.size,
        })
    }

    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub const fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

/// Push constant range of `size` bytes visible to `stages`.
pub(crate) const fn push_range(stages: vk::ShaderStageFlags, size: usize) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: stages,
        offset: 0,
        size: size as u32,
    }
}
