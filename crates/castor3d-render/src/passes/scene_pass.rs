//! Rasterising the scene into attachments.

use super::{record_steps, PassStep};
use crate::graph::{RecordContext, RunnablePass};
use crate::scene::SceneGeometry;
use castor3d_gpu::{vk, ColorAttachment, DepthAttachment, Pipeline, RenderingDesc, Result};
use std::sync::Arc;

/// Draws the scene geometry with one pipeline inside a dynamic rendering scope.
pub struct ScenePass {
    pipeline: Pipeline,
    descriptor_set: vk::DescriptorSet,
    push_constants: Vec<u8>,
    push_stages: vk::ShaderStageFlags,
    extent: vk::Extent2D,
    layer_count: u32,
    color: Vec<ColorAttachment>,
    depth: Option<DepthAttachment>,
    geometry: Arc<dyn SceneGeometry>,
    before: Vec<PassStep>,
    after: Vec<PassStep>,
}

impl ScenePass {
    pub fn new(
        pipeline: Pipeline,
        descriptor_set: vk::DescriptorSet,
        extent: vk::Extent2D,
        geometry: Arc<dyn SceneGeometry>,
    ) -> Self {
        Self {
            pipeline,
            descriptor_set,
            push_constants: Vec::new(),
            push_stages: vk::ShaderStageFlags::VERTEX,
            extent,
            layer_count: 1,
            color: Vec::new(),
            depth: None,
            geometry,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    #[must_use]
    pub fn color(mut self, attachment: ColorAttachment) -> Self {
        self.color.push(attachment);
        self
    }

    #[must_use]
    pub fn depth(mut self, attachment: DepthAttachment) -> Self {
        self.depth = Some(attachment);
        self
    }

    #[must_use]
    pub fn layer_count(mut self, count: u32) -> Self {
        self.layer_count = count;
        self
    }

    #[must_use]
    pub fn with_push_constants<T: bytemuck::Pod>(
        mut self,
        stages: vk::ShaderStageFlags,
        value: &T,
    ) -> Self {
        self.push_stages = stages;
        self.push_constants = bytemuck::bytes_of(value).to_vec();
        self
    }

    #[must_use]
    pub fn before(mut self, step: PassStep) -> Self {
        self.before.push(step);
        self
    }

    #[must_use]
    pub fn after(mut self, step: PassStep) -> Self {
        self.after.push(step);
        self
    }
}

impl RunnablePass for ScenePass {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()> {
        let device = ctx.device;
        let cb = ctx.command_buffer;
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent,
        };

        record_steps(&self.before, device, cb);
        device.cmd_begin_rendering(
            cb,
            &RenderingDesc {
                area,
                layer_count: self.layer_count,
                color: &self.color,
                depth: self.depth,
            },
        );
        device.cmd_set_viewport(
            cb,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.extent.width as f32,
                height: self.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        device.cmd_set_scissor(cb, area);
        device.cmd_bind_pipeline(cb, &self.pipeline);
        if self.descriptor_set != vk::DescriptorSet::null() {
            device.cmd_bind_descriptor_set(cb, &self.pipeline, 0, self.descriptor_set);
        }
        if !self.push_constants.is_empty() {
            device.cmd_push_constants(cb, &self.pipeline, self.push_stages, &self.push_constants);
        }
        let drawn = self.geometry.record_draws(device, cb, &self.pipeline);
        device.cmd_end_rendering(cb);
        drawn?;
        record_steps(&self.after, device, cb);
        Ok(())
    }
}
