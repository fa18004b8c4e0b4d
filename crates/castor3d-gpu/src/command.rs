//! Command buffer management.

use crate::device::{Device, QueueKind, QueueSubmit};
use crate::error::Result;
use crate::sync::SemaphoreWait;
use ash::vk;
use std::sync::Arc;

/// One command buffer paired with the semaphore signalling its completion.
///
/// The semaphore is only ever signalled by submissions of this command
/// buffer, so waiting on it means waiting on this recorded work.
pub struct CommandsSemaphore {
    device: Arc<dyn Device>,
    queue: QueueKind,
    command_buffer: vk::CommandBuffer,
    semaphore: vk::Semaphore,
}

impl CommandsSemaphore {
    /// Allocate the command buffer from `queue`'s pool and create its semaphore.
    pub fn new(device: Arc<dyn Device>, queue: QueueKind, name: &str) -> Result<Self> {
        let command_buffer = device.allocate_command_buffer(queue)?;
        let semaphore = match device.create_semaphore(name) {
            Ok(semaphore) => semaphore,
            Err(err) => {
                device.free_command_buffer(queue, command_buffer);
                return Err(err);
            }
        };

        Ok(Self {
            device,
            queue,
            command_buffer,
            semaphore,
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        self.device.begin_command_buffer(self.command_buffer, flags)
    }

    pub fn end(&self) -> Result<()> {
        self.device.end_command_buffer(self.command_buffer)
    }

    /// Submit the command buffer after `to_wait`, signalling the semaphore.
    ///
    /// Returns the wait a consumer uses to depend on this work.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(
        &self,
        to_wait: &[SemaphoreWait],
        signal_stage: vk::PipelineStageFlags,
        fence: Option<vk::Fence>,
    ) -> Result<SemaphoreWait> {
        self.submit_signalling(to_wait, &[], fence)?;
        Ok(SemaphoreWait::new(self.semaphore, signal_stage))
    }

    /// Submit the command buffer, signalling the own semaphore and `extra`.
    ///
    /// Binary semaphores are consumed by a single wait, so work read by
    /// several consumers signals one semaphore per consumer.
    pub fn submit_signalling(
        &self,
        to_wait: &[SemaphoreWait],
        extra: &[vk::Semaphore],
        fence: Option<vk::Fence>,
    ) -> Result<()> {
        let mut signal = Vec::with_capacity(extra.len() + 1);
        signal.push(self.semaphore);
        signal.extend_from_slice(extra);

        self.device.submit(
            self.queue,
            &QueueSubmit {
                command_buffers: &[self.command_buffer],
                wait: to_wait,
                signal: &signal,
                fence,
            },
        )
    }
}

impl Drop for CommandsSemaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        self.device.free_command_buffer(self.queue, self.command_buffer);
    }
}

/// Record, submit and wait for a one-shot command buffer.
///
/// Blocks on a fence; only meant for initialisation work.
pub fn execute_single_time_commands<F>(device: &dyn Device, queue: QueueKind, f: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let cmd = device.allocate_command_buffer(queue)?;
    let result = record_and_wait(device, queue, cmd, f);
    device.free_command_buffer(queue, cmd);
    result
}

fn record_and_wait<F>(device: &dyn Device, queue: QueueKind, cmd: vk::CommandBuffer, f: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    f(cmd)?;
    device.end_command_buffer(cmd)?;

    let fence = device.create_fence(false)?;
    let submitted = device
        .submit(
            queue,
            &QueueSubmit {
                command_buffers: &[cmd],
                fence: Some(fence),
                ..Default::default()
            },
        )
        .and_then(|()| device.wait_for_fence(fence, u64::MAX));
    device.destroy_fence(fence);
    submitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn submit_waits_and_signals() {
        let device = Arc::new(MockDevice::new());
        let upstream = device.create_semaphore("Upstream").unwrap();
        device.signal_semaphore(upstream).unwrap();

        let commands = CommandsSemaphore::new(device.clone(), QueueKind::Compute, "Pass").unwrap();
        commands
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        device.cmd_dispatch(commands.command_buffer(), 4, 4, 4);
        commands.end().unwrap();

        let wait = [SemaphoreWait::new(
            upstream,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        )];
        let out = commands
            .submit(&wait, vk::PipelineStageFlags::FRAGMENT_SHADER, None)
            .unwrap();
        assert_eq!(out.semaphore, commands.semaphore());
        assert_eq!(out.stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].queue, QueueKind::Compute);
        assert_eq!(submissions[0].waits, wait.to_vec());
        assert_eq!(submissions[0].signals, vec![commands.semaphore()]);
        assert!(device.is_semaphore_pending(commands.semaphore()));
    }

    #[test]
    fn fan_out_signals_every_semaphore() {
        let device = Arc::new(MockDevice::new());
        let extra = device.create_semaphore("Second consumer").unwrap();
        let commands = CommandsSemaphore::new(device.clone(), QueueKind::Graphics, "Pass").unwrap();
        commands.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        commands.end().unwrap();
        commands.submit_signalling(&[], &[extra], None).unwrap();
        assert!(device.is_semaphore_pending(commands.semaphore()));
        assert!(device.is_semaphore_pending(extra));
    }

    #[test]
    fn drop_releases_both_objects() {
        let device = Arc::new(MockDevice::new());
        let commands = CommandsSemaphore::new(device.clone(), QueueKind::Graphics, "Pass").unwrap();
        assert_eq!(device.live_semaphore_count(), 1);
        assert_eq!(device.live_command_buffer_count(), 1);
        drop(commands);
        assert_eq!(device.live_semaphore_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn single_time_commands_run_and_clean_up() {
        let device = MockDevice::new();
        let mut recorded = None;
        execute_single_time_commands(&device, QueueKind::Transfer, |cmd| {
            device.cmd_dispatch(cmd, 1, 1, 1);
            recorded = Some(cmd);
            Ok(())
        })
        .unwrap();
        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].command_buffers, vec![recorded.unwrap()]);
        assert!(submissions[0].fence.is_some());
        assert_eq!(device.live_command_buffer_count(), 0);
    }

    #[test]
    fn single_time_failure_frees_the_buffer() {
        let device = MockDevice::new();
        let result = execute_single_time_commands(&device, QueueKind::Graphics, |_| {
            Err(crate::error::GpuError::Other("record failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(device.submission_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
    }
}
