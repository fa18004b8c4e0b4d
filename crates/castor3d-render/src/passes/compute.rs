//! A single compute dispatch.

use super::{record_steps, PassStep};
use crate::graph::{RecordContext, RunnablePass};
use castor3d_gpu::{vk, Pipeline, Result};

/// Binds one pipeline and descriptor set and dispatches a fixed grid.
#[derive(Debug, Clone)]
pub struct ComputePass {
    pipeline: Pipeline,
    descriptor_set: vk::DescriptorSet,
    push_constants: Vec<u8>,
    groups: [u32; 3],
    before: Vec<PassStep>,
    after: Vec<PassStep>,
}

impl ComputePass {
    pub fn new(pipeline: Pipeline, descriptor_set: vk::DescriptorSet, groups: [u32; 3]) -> Self {
        Self {
            pipeline,
            descriptor_set,
            push_constants: Vec::new(),
            groups,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_push_constants<T: bytemuck::Pod>(mut self, value: &T) -> Self {
        self.push_constants = bytemuck::bytes_of(value).to_vec();
        self
    }

    /// Record `step` before the dispatch.
    #[must_use]
    pub fn before(mut self, step: PassStep) -> Self {
        self.before.push(step);
        self
    }

    /// Record `step` after the dispatch.
    #[must_use]
    pub fn after(mut self, step: PassStep) -> Self {
        self.after.push(step);
        self
    }

    pub const fn groups(&self) -> [u32; 3] {
        self.groups
    }
}

/// Groups of `local` invocations covering `size` items.
pub const fn group_count(size: u32, local: u32) -> u32 {
    size.div_ceil(local)
}

impl RunnablePass for ComputePass {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()> {
        let device = ctx.device;
        let cb = ctx.command_buffer;
        record_steps(&self.before, device, cb);
        device.cmd_bind_pipeline(cb, &self.pipeline);
        if self.descriptor_set != vk::DescriptorSet::null() {
            device.cmd_bind_descriptor_set(cb, &self.pipeline, 0, self.descriptor_set);
        }
        if !self.push_constants.is_empty() {
            device.cmd_push_constants(
                cb,
                &self.pipeline,
                vk::ShaderStageFlags::COMPUTE,
                &self.push_constants,
            );
        }
        let [x, y, z] = self.groups;
        device.cmd_dispatch(cb, x, y, z);
        record_steps(&self.after, device, cb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor3d_gpu::mock::{MockCommand, MockDevice};
    use castor3d_gpu::{Device, QueueKind};

    #[test]
    fn records_bind_push_and_dispatch() {
        let device = MockDevice::new();
        let pipeline = device.create_compute_pipeline(&[0], &[], &[]).unwrap();
        let cb = device.allocate_command_buffer(QueueKind::Compute).unwrap();
        device
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();

        let mut pass = ComputePass::new(pipeline, vk::DescriptorSet::null(), [4, 2, 1])
            .with_push_constants(&1.5f32);
        let mut ctx = RecordContext {
            device: &device,
            command_buffer: cb,
            frame: 0,
            pass_name: "Test",
        };
        pass.record(&mut ctx).unwrap();

        let commands = device.recorded_commands(cb);
        assert!(matches!(commands[0], MockCommand::BindPipeline(_)));
        assert!(matches!(commands[1], MockCommand::PushConstants { .. }));
        assert!(matches!(
            commands[2],
            MockCommand::Dispatch { x: 4, y: 2, z: 1 }
        ));
        assert_eq!(group_count(129, 8), 17);
    }
}
