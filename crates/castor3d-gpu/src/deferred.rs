//! Deferred resource release for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be released
//! immediately as they may still be referenced by a frame being executed.
//! [`RetirementQueue`] tags each retired resource with the frame it was
//! retired in and hands it back once that frame can no longer be running.

use crate::error::Result;
use std::collections::VecDeque;

struct Retired<T> {
    item: T,
    frame: u64,
}

/// Queue of resources waiting for the frames that used them to complete.
///
/// A resource retired during frame `f` is released by
/// [`RetirementQueue::process`] once the current frame reaches
/// `f + retire_after`, or by [`RetirementQueue::process_completed`] as soon
/// as frame `f` is known to have completed on the GPU.
pub struct RetirementQueue<T> {
    pending: VecDeque<Retired<T>>,
    retire_after: u64,
}

impl<T> RetirementQueue<T> {
    /// Create a queue releasing resources `retire_after` frames after retirement.
    pub fn new(retire_after: u64) -> Self {
        Self {
            pending: VecDeque::new(),
            retire_after,
        }
    }

    /// Queue `item`, last used by frame `frame`.
    ///
    /// Frame tags are kept non-decreasing: an item tagged older than the
    /// newest pending one takes the newer tag, which only delays its release.
    pub fn retire(&mut self, item: T, frame: u64) {
        let frame = self
            .pending
            .back()
            .map_or(frame, |newest| newest.frame.max(frame));
        self.pending.push_back(Retired { item, frame });
    }

    fn release_while(
        &mut self,
        mut ready: impl FnMut(u64) -> bool,
        mut release: impl FnMut(T) -> Result<()>,
    ) -> Result<usize> {
        let mut released = 0;
        // Tags are non-decreasing, so only the front can mature.
        while let Some(front) = self.pending.front() {
            if !ready(front.frame) {
                break;
            }
            if let Some(retired) = self.pending.pop_front() {
                release(retired.item)?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Release every resource retired at least `retire_after` frames before
    /// `current_frame`. Returns how many were released.
    pub fn process(
        &mut self,
        current_frame: u64,
        release: impl FnMut(T) -> Result<()>,
    ) -> Result<usize> {
        let retire_after = self.retire_after;
        self.release_while(
            |frame| frame.saturating_add(retire_after) <= current_frame,
            release,
        )
    }

    /// Release every resource retired during or before `completed_frame`.
    pub fn process_completed(
        &mut self,
        completed_frame: u64,
        release: impl FnMut(T) -> Result<()>,
    ) -> Result<usize> {
        self.release_while(|frame| frame <= completed_frame, release)
    }

    /// Release everything. Only valid once the device is idle.
    pub fn flush(&mut self, release: impl FnMut(T) -> Result<()>) -> Result<usize> {
        self.release_while(|_| true, release)
    }

    /// Get the number of pending releases.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn retire_after(&self) -> u64 {
        self.retire_after
    }

    /// Change the delay, e.g. when the number of frames in flight changes.
    pub fn set_retire_after(&mut self, retire_after: u64) {
        self.retire_after = retire_after;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;

    fn collect<T>(out: &mut Vec<T>) -> impl FnMut(T) -> Result<()> + '_ {
        move |item| {
            out.push(item);
            Ok(())
        }
    }

    #[test]
    fn releases_after_the_delay() {
        let mut queue = RetirementQueue::new(2);
        queue.retire("a", 0);
        queue.retire("b", 1);

        let mut released = Vec::new();
        assert_eq!(queue.process(1, collect(&mut released)).unwrap(), 0);
        assert_eq!(queue.process(2, collect(&mut released)).unwrap(), 1);
        assert_eq!(released, vec!["a"]);
        assert_eq!(queue.process(3, collect(&mut released)).unwrap(), 1);
        assert_eq!(released, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn completed_frames_release_early() {
        let mut queue = RetirementQueue::new(3);
        queue.retire(1, 4);
        queue.retire(2, 5);
        let mut released = Vec::new();
        queue
            .process_completed(4, collect(&mut released))
            .unwrap();
        assert_eq!(released, vec![1]);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn out_of_order_tag_is_delayed() {
        let mut queue = RetirementQueue::new(1);
        queue.retire('x', 5);
        queue.retire('y', 2);
        let mut released = Vec::new();
        queue
            .process(5, collect(&mut released))
            .unwrap();
        assert!(released.is_empty());
        queue
            .process(6, collect(&mut released))
            .unwrap();
        assert_eq!(released, vec!['x', 'y']);
    }

    #[test]
    fn release_error_keeps_the_rest() {
        let mut queue = RetirementQueue::new(0);
        queue.retire(1, 0);
        queue.retire(2, 0);
        let result = queue.flush(|_| Err(GpuError::Other("busy".into())));
        assert!(result.is_err());
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.flush(|_| Ok(())).unwrap(), 1);
    }
}
