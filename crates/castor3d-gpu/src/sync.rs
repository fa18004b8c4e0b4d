//! Synchronization primitives.

use crate::device::{Device, QueueKind, QueueSubmit};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// A semaphore a submission must wait on, with the stage that waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

impl SemaphoreWait {
    pub const fn new(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self { semaphore, stage }
    }
}

/// Waits returned by a pass chain, consumed by the next one.
pub type SemaphoreWaitArray = Vec<SemaphoreWait>;

/// Split waits into the parallel arrays `vkQueueSubmit` expects.
pub fn split_waits(waits: &[SemaphoreWait]) -> (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) {
    waits.iter().map(|w| (w.semaphore, w.stage)).unzip()
}

/// Hands one set of waits to several independent consumers.
///
/// A binary semaphore is consumed by a single wait, so the waits go through
/// an empty submission signalling one semaphore per consumer.
pub struct SemaphoreRelay {
    device: Arc<dyn Device>,
    name: String,
    semaphores: Vec<vk::Semaphore>,
}

impl SemaphoreRelay {
    pub fn new(device: Arc<dyn Device>, name: impl Into<String>) -> Self {
        Self {
            device,
            name: name.into(),
            semaphores: Vec::new(),
        }
    }

    /// Waits for each of `consumers`, all covering `to_wait`.
    ///
    /// Nothing is submitted when there is nothing to wait on or a single
    /// consumer; each relayed wait covers the union of the stages of
    /// `to_wait`.
    pub fn split(
        &mut self,
        to_wait: &[SemaphoreWait],
        queue: QueueKind,
        consumers: usize,
    ) -> Result<Vec<SemaphoreWaitArray>> {
        if consumers <= 1 || to_wait.is_empty() {
            return Ok(vec![to_wait.to_vec(); consumers]);
        }
        while self.semaphores.len() < consumers {
            let name = format!("{}/Input/{}", self.name, self.semaphores.len());
            self.semaphores.push(self.device.create_semaphore(&name)?);
        }

        let signal = &self.semaphores[..consumers];
        self.device.submit(
            queue,
            &QueueSubmit {
                command_buffers: &[],
                wait: to_wait,
                signal,
                fence: None,
            },
        )?;
        let stage = to_wait
            .iter()
            .fold(vk::PipelineStageFlags::empty(), |stages, wait| stages | wait.stage);
        Ok(signal
            .iter()
            .map(|&semaphore| vec![SemaphoreWait::new(semaphore, stage)])
            .collect())
    }
}

impl Drop for SemaphoreRelay {
    fn drop(&mut self) {
        for semaphore in self.semaphores.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

/// Tracks which frames the GPU has finished, through a ring of fences.
///
/// Frame `n` uses fence slot `n % frames_in_flight`. Beginning frame `n` waits
/// on that slot, which proves frame `n - frames_in_flight` completed.
pub struct FrameTracker {
    device: Arc<dyn Device>,
    fences: Vec<vk::Fence>,
    /// Frame last submitted with each fence, if any.
    submitted: Vec<Option<u64>>,
    current_frame: u64,
    completed_frame: Option<u64>,
}

impl FrameTracker {
    /// Create a tracker for the given number of frames in flight.
    pub fn new(device: Arc<dyn Device>, frames_in_flight: u32) -> Result<Self> {
        let count = frames_in_flight.max(1) as usize;
        let mut fences = Vec::with_capacity(count);
        for _ in 0..count {
            fences.push(device.create_fence(false)?);
        }

        Ok(Self {
            device,
            fences,
            submitted: vec![None; count],
            current_frame: 0,
            completed_frame: None,
        })
    }

    fn slot(&self) -> usize {
        (self.current_frame % self.fences.len() as u64) as usize
    }

    /// Wait until the frame that last used this slot has completed.
    ///
    /// Returns the index of the frame being started.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self) -> Result<u64> {
        let slot = self.slot();
        if let Some(frame) = self.submitted[slot].take() {
            let fence = self.fences[slot];
            self.device.wait_for_fence(fence, u64::MAX)?;
            self.device.reset_fence(fence)?;
            self.completed_frame = Some(self.completed_frame.map_or(frame, |c| c.max(frame)));
        }
        Ok(self.current_frame)
    }

    /// Jump to `frame` and begin it, waiting on the slot it reuses.
    pub fn begin_frame_at(&mut self, frame: u64) -> Result<u64> {
        self.current_frame = frame;
        self.begin_frame()
    }

    /// Fence slot of the current frame.
    pub fn frame_slot(&self) -> usize {
        self.slot()
    }

    /// Fence to attach to the last submission of the current frame.
    pub fn frame_fence(&mut self) -> vk::Fence {
        let slot = self.slot();
        self.submitted[slot] = Some(self.current_frame);
        self.fences[slot]
    }

    /// Forget the fence handed out for the current frame after its
    /// submission failed.
    pub fn abandon_frame(&mut self) {
        let slot = self.slot();
        self.submitted[slot] = None;
    }

    /// Move on to the next frame.
    pub fn end_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Index of the frame being recorded.
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Most recent frame known to have completed on the GPU.
    pub fn completed_frame(&self) -> Option<u64> {
        self.completed_frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.fences.len()
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        for (slot, fence) in self.fences.iter().enumerate() {
            if self.submitted[slot].is_some() {
                let _ = self.device.wait_for_fence(*fence, u64::MAX);
            }
            self.device.destroy_fence(*fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn split_keeps_pairs() {
        let waits = [
            SemaphoreWait::new(vk::Semaphore::null(), vk::PipelineStageFlags::FRAGMENT_SHADER),
            SemaphoreWait::new(vk::Semaphore::null(), vk::PipelineStageFlags::COMPUTE_SHADER),
        ];
        let (semaphores, stages) = split_waits(&waits);
        assert_eq!(semaphores.len(), 2);
        assert_eq!(stages[1], vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn relay_gives_each_consumer_its_own_semaphore() {
        let device = Arc::new(MockDevice::new());
        let upstream = device.create_semaphore("Upstream").unwrap();
        device.signal_semaphore(upstream).unwrap();
        let mut relay = SemaphoreRelay::new(device.clone(), "Branches");

        let to_wait = [SemaphoreWait::new(upstream, vk::PipelineStageFlags::TRANSFER)];
        let split = relay.split(&to_wait, QueueKind::Graphics, 3).unwrap();
        assert_eq!(split.len(), 3);
        assert_eq!(device.submission_count(), 1);
        assert!(!device.is_semaphore_pending(upstream));
        for waits in &split {
            assert_eq!(waits.len(), 1);
            assert_eq!(waits[0].stage, vk::PipelineStageFlags::TRANSFER);
            device.consume_waits(waits).unwrap();
        }
        assert_ne!(split[0], split[1]);

        // A single consumer or an empty input needs no relay.
        assert_eq!(
            relay.split(&[], QueueKind::Graphics, 2).unwrap(),
            vec![Vec::new(), Vec::new()]
        );
        assert_eq!(device.submission_count(), 1);

        drop(relay);
        device.destroy_semaphore(upstream);
        assert_eq!(device.live_semaphore_count(), 0);
    }

    #[test]
    fn completed_frame_follows_ring() {
        let device = Arc::new(MockDevice::new());
        let mut tracker = FrameTracker::new(device.clone(), 2).unwrap();

        for expected_completed in [None, None, Some(0), Some(1), Some(2)] {
            tracker.begin_frame().unwrap();
            assert_eq!(tracker.completed_frame(), expected_completed);
            let fence = tracker.frame_fence();
            device
                .submit(
                    QueueKind::Graphics,
                    &QueueSubmit {
                        fence: Some(fence),
                        ..Default::default()
                    },
                )
                .unwrap();
            tracker.end_frame();
        }
        assert_eq!(tracker.current_frame(), 5);
    }

    #[test]
    fn unsubmitted_slot_does_not_block() {
        let device = Arc::new(MockDevice::new());
        let mut tracker = FrameTracker::new(device, 3).unwrap();
        for frame in 0..6 {
            assert_eq!(tracker.begin_frame().unwrap(), frame);
            tracker.end_frame();
        }
        assert_eq!(tracker.completed_frame(), None);
    }

    #[test]
    fn begin_frame_at_waits_on_the_reused_slot() {
        let device = Arc::new(MockDevice::new());
        let mut tracker = FrameTracker::new(device.clone(), 2).unwrap();

        tracker.begin_frame_at(4).unwrap();
        assert_eq!(tracker.frame_slot(), 0);
        let fence = tracker.frame_fence();
        device
            .submit(
                QueueKind::Graphics,
                &QueueSubmit {
                    fence: Some(fence),
                    ..Default::default()
                },
            )
            .unwrap();

        tracker.begin_frame_at(5).unwrap();
        assert_eq!(tracker.completed_frame(), None);
        tracker.begin_frame_at(6).unwrap();
        assert_eq!(tracker.completed_frame(), Some(4));
        assert!(!device.is_fence_signaled(fence).unwrap());
    }

    #[test]
    fn abandoned_frame_is_not_waited_on() {
        let device = Arc::new(MockDevice::new());
        let mut tracker = FrameTracker::new(device, 1).unwrap();
        tracker.begin_frame().unwrap();
        let _ = tracker.frame_fence();
        tracker.abandon_frame();
        tracker.end_frame();
        // The fence was never submitted; waiting on it would time out.
        tracker.begin_frame().unwrap();
        assert_eq!(tracker.completed_frame(), None);
    }
}
