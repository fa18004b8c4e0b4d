//! The contract every frame component follows.
//!
//! A component is updated on the CPU, then uploads what changed, then
//! submits its passes after the waits it is given and hands back the waits
//! of its own output:
//!
//! ```text
//! update_cpu -> update_gpu -> render(to_wait) -> waits for the next component
//! ```

use crate::camera::Camera;
use crate::graph::RunnableGraph;
use crate::scene::SceneGraphView;
use castor3d_gpu::{vk, GpuError, QueueKind, Result, SemaphoreWait, SemaphoreWaitArray};

/// CPU-side update inputs for one frame.
pub struct CpuUpdater<'a> {
    pub frame: u64,
    pub camera: &'a Camera,
    pub scene: &'a dyn SceneGraphView,
}

/// GPU-side update inputs for one frame.
#[derive(Debug, Clone, Copy)]
pub struct GpuUpdater {
    pub frame: u64,
    /// Command buffer recording the frame's uploads, when one is open.
    pub upload: Option<vk::CommandBuffer>,
}

/// Walks a component's passes and resources for debug views.
pub trait RenderTechniqueVisitor {
    fn visit_pass(&mut self, _component: &str, _pass: &str, _enabled: bool) {}
    fn visit_image(&mut self, _component: &str, _name: &str, _image: vk::Image) {}
    fn visit_buffer(&mut self, _component: &str, _name: &str, _buffer: vk::Buffer) {}
}

/// Lifecycle of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Uninitialised,
    Initialising,
    Ready,
    Rendering,
    Cleanup,
}

/// A renderer component driven once per frame.
pub trait FrameComponent {
    fn name(&self) -> &str;

    fn state(&self) -> ComponentState;

    /// Recompute CPU-side state. Touches no GPU object.
    fn update_cpu(&mut self, updater: &CpuUpdater<'_>) -> Result<()>;

    /// Write the data computed by [`FrameComponent::update_cpu`] to GPU buffers.
    fn update_gpu(&mut self, updater: &GpuUpdater) -> Result<()>;

    /// Submit the component's passes after `to_wait`.
    fn render(&mut self, to_wait: &[SemaphoreWait], queue: QueueKind) -> Result<SemaphoreWaitArray>;

    fn accept(&self, visitor: &mut dyn RenderTechniqueVisitor);

    /// Upper bound of the GPU objects created while initialising.
    fn count_initialisation_steps(&self) -> u32;
}

/// Receives initialisation progress.
pub trait ProgressBar {
    fn set_range(&mut self, steps: u32);
    fn step(&mut self, label: &str);
}

/// A progress bar that only counts.
#[derive(Debug, Default, Clone)]
pub struct CountingProgress {
    pub range: u32,
    pub steps: u32,
    pub labels: Vec<String>,
}

impl ProgressBar for CountingProgress {
    fn set_range(&mut self, steps: u32) {
        self.range = steps;
    }

    fn step(&mut self, label: &str) {
        self.steps += 1;
        self.labels.push(label.to_owned());
    }
}

/// Report one step if a progress bar is attached.
pub(crate) fn step(progress: &mut Option<&mut dyn ProgressBar>, label: &str) {
    if let Some(progress) = progress.as_deref_mut() {
        progress.step(label);
    }
}

/// Lend an attached progress bar to a sub-component.
pub(crate) fn reborrow<'a>(
    progress: &'a mut Option<&mut dyn ProgressBar>,
) -> Option<&'a mut dyn ProgressBar> {
    match progress {
        Some(progress) => Some(&mut **progress),
        None => None,
    }
}

/// Tracks the update order of a component.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UpdateTracker {
    pub state: ComponentState,
    cpu_frame: Option<u64>,
}

impl UpdateTracker {
    pub const fn ready() -> Self {
        Self {
            state: ComponentState::Ready,
            cpu_frame: None,
        }
    }

    pub fn cpu_updated(&mut self, frame: u64) {
        self.cpu_frame = Some(frame);
    }

    /// Fails unless the CPU update of `frame` already ran.
    pub fn check_gpu_update(&self, name: &str, frame: u64) -> Result<()> {
        if self.cpu_frame == Some(frame) {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "{name}: GPU update of frame {frame} before its CPU update"
            )))
        }
    }

    pub fn rendered(&mut self) {
        self.state = ComponentState::Rendering;
    }
}

/// Report every pass of `graph` to `visitor`.
pub(crate) fn visit_graph(
    component: &str,
    graph: &RunnableGraph,
    visitor: &mut dyn RenderTechniqueVisitor,
) {
    for id in graph.order() {
        if let Some(pass) = graph.pass_name(id) {
            visitor.visit_pass(component, pass, graph.is_enabled(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_update_requires_cpu_update_of_the_same_frame() {
        let mut tracker = UpdateTracker::ready();
        assert!(tracker.check_gpu_update("Test", 0).is_err());
        tracker.cpu_updated(0);
        assert!(tracker.check_gpu_update("Test", 0).is_ok());
        assert!(tracker.check_gpu_update("Test", 1).is_err());
    }

    #[test]
    fn counting_progress_keeps_labels() {
        let mut progress = CountingProgress::default();
        let mut attached: Option<&mut dyn ProgressBar> = Some(&mut progress);
        step(&mut attached, "Pipeline");
        step(&mut attached, "Descriptors");
        assert_eq!(progress.steps, 2);
        assert_eq!(progress.labels[1], "Descriptors");
    }
}
