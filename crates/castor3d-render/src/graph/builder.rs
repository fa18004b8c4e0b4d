//! Frame graph declaration and compilation.

use super::resource::{Hazard, PassId, ResourceDesc, ResourceId, ResourceKind};
use super::runnable::{EnabledCallback, RecordMode, RunnableGraph, RunnablePass};
use castor3d_gpu::{Device, GpuError, QueueKind, Result};
use ash::vk;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;

/// Declaration of one pass.
pub struct PassDesc {
    pub(crate) name: String,
    pub(crate) queue: Option<QueueKind>,
    pub(crate) reads: Vec<ResourceId>,
    pub(crate) writes: Vec<ResourceId>,
    pub(crate) after: Vec<PassId>,
    pub(crate) wait_stage: vk::PipelineStageFlags,
    pub(crate) output_stage: vk::PipelineStageFlags,
    pub(crate) record_mode: RecordMode,
    pub(crate) enabled: Option<EnabledCallback>,
    pub(crate) runnable: Box<dyn RunnablePass>,
}

impl PassDesc {
    /// A pass recording with `runnable`, re-recorded every frame.
    pub fn new(name: impl Into<String>, runnable: impl RunnablePass + 'static) -> Self {
        Self {
            name: name.into(),
            queue: None,
            reads: Vec::new(),
            writes: Vec::new(),
            after: Vec::new(),
            wait_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            output_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            record_mode: RecordMode::EveryFrame,
            enabled: None,
            runnable: Box::new(runnable),
        }
    }

    #[must_use]
    pub fn reads(mut self, resource: ResourceId) -> Self {
        self.reads.push(resource);
        self
    }

    #[must_use]
    pub fn writes(mut self, resource: ResourceId) -> Self {
        self.writes.push(resource);
        self
    }

    /// Order after `pass` even without a shared resource.
    #[must_use]
    pub fn after(mut self, pass: PassId) -> Self {
        self.after.push(pass);
        self
    }

    /// Submit to `queue` instead of the queue given to [`RunnableGraph::run`].
    #[must_use]
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Stage at which this pass waits on its producers.
    #[must_use]
    pub fn wait_stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.wait_stage = stage;
        self
    }

    /// Stage handed to waits on this pass when it ends the graph.
    #[must_use]
    pub fn output_stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.output_stage = stage;
        self
    }

    #[must_use]
    pub fn record_mode(mut self, mode: RecordMode) -> Self {
        self.record_mode = mode;
        self
    }

    /// Skip the pass on frames where `callback` returns `false`.
    #[must_use]
    pub fn enabled_if(mut self, callback: EnabledCallback) -> Self {
        self.enabled = Some(callback);
        self
    }
}

/// A set of passes and the resources they touch.
///
/// Hazards are derived in declaration order: a pass depends on the last
/// writer of each resource it reads or writes, and a writer depends on every
/// reader since the previous write.
pub struct FrameGraph {
    name: String,
    resources: Vec<ResourceDesc>,
    passes: Vec<PassDesc>,
    frames_in_flight: u32,
}

impl FrameGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
            passes: Vec::new(),
            frames_in_flight: 2,
        }
    }

    /// Number of frames whose commands may be in flight at once.
    ///
    /// Each pass keeps one command set per frame slot.
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames_in_flight: u32) -> Self {
        self.frames_in_flight = frames_in_flight.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_resource(&mut self, name: impl Into<String>, kind: ResourceKind) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        self.resources.push(ResourceDesc {
            name: name.into(),
            kind,
        });
        id
    }

    pub fn add_image(&mut self, name: impl Into<String>) -> ResourceId {
        self.add_resource(name, ResourceKind::Image)
    }

    pub fn add_buffer(&mut self, name: impl Into<String>) -> ResourceId {
        self.add_resource(name, ResourceKind::Buffer)
    }

    pub fn add_pass(&mut self, pass: PassDesc) -> PassId {
        let id = PassId(self.passes.len() as u32);
        self.passes.push(pass);
        id
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceDesc> {
        self.resources.get(id.0 as usize)
    }

    /// Every dependency edge, before reduction.
    pub fn edges(&self) -> Result<Vec<(PassId, PassId, Hazard)>> {
        let mut edges = Vec::new();
        let mut last_writer: Vec<Option<usize>> = vec![None; self.resources.len()];
        let mut readers: Vec<Vec<usize>> = vec![Vec::new(); self.resources.len()];

        for (index, pass) in self.passes.iter().enumerate() {
            for &dependency in &pass.after {
                if dependency.index() >= self.passes.len() {
                    return Err(GpuError::InvalidHandle(format!(
                        "pass {} of graph {} depends on unknown pass {dependency}",
                        pass.name, self.name
                    )));
                }
                edges.push((dependency.index(), index, Hazard::Explicit));
            }

            for resource in pass.reads.iter().chain(&pass.writes) {
                if resource.0 as usize >= self.resources.len() {
                    return Err(GpuError::InvalidHandle(format!(
                        "pass {} of graph {} uses unknown resource {resource:?}",
                        pass.name, self.name
                    )));
                }
            }

            for resource in &pass.reads {
                let slot = resource.0 as usize;
                if let Some(writer) = last_writer[slot] {
                    edges.push((writer, index, Hazard::ReadAfterWrite));
                }
                readers[slot].push(index);
            }

            for resource in &pass.writes {
                let slot = resource.0 as usize;
                if let Some(writer) = last_writer[slot] {
                    edges.push((writer, index, Hazard::WriteAfterWrite));
                }
                for &reader in &readers[slot] {
                    edges.push((reader, index, Hazard::WriteAfterRead));
                }
                last_writer[slot] = Some(index);
                readers[slot].clear();
            }
        }

        Ok(edges
            .into_iter()
            .filter(|(from, to, _)| from != to)
            .map(|(from, to, hazard)| (PassId(from as u32), PassId(to as u32), hazard))
            .collect())
    }

    /// Order the passes and create their command buffers and semaphores.
    pub fn compile(self, device: Arc<dyn Device>) -> Result<RunnableGraph> {
        let count = self.passes.len();
        let edges = self.edges()?;
        for (from, to, hazard) in &edges {
            tracing::trace!(
                graph = %self.name,
                from = %self.passes[from.index()].name,
                to = %self.passes[to.index()].name,
                ?hazard,
                "Frame graph edge"
            );
        }

        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        for (from, to, _) in &edges {
            successors[from.index()].insert(to.index());
        }

        let order = topological_order(&successors).ok_or_else(|| {
            GpuError::GraphCycle(format!("{} ({} passes)", self.name, count))
        })?;
        let predecessors = reduced_predecessors(&successors, &order);

        tracing::debug!(
            graph = %self.name,
            passes = count,
            edges = edges.len(),
            "Compiled frame graph"
        );

        RunnableGraph::new(
            device,
            self.name,
            self.passes,
            order,
            predecessors,
            self.frames_in_flight,
        )
    }
}

/// Kahn's algorithm, taking the lowest declaration index among ready passes.
fn topological_order(successors: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut in_degree = vec![0usize; successors.len()];
    for targets in successors {
        for &to in targets {
            in_degree[to] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(successors.len());

    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &to in &successors[index] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                ready.push(Reverse(to));
            }
        }
    }

    (order.len() == successors.len()).then_some(order)
}

/// Direct predecessors of each pass after transitive reduction.
///
/// An edge implied by a longer path adds nothing to the ordering and would
/// cost a semaphore, so it is dropped.
fn reduced_predecessors(successors: &[BTreeSet<usize>], order: &[usize]) -> Vec<Vec<usize>> {
    let count = successors.len();
    // reachable[i] holds every pass reachable from i.
    let mut reachable: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
    for &index in order.iter().rev() {
        let mut set = BTreeSet::new();
        for &to in &successors[index] {
            set.insert(to);
            set.extend(reachable[to].iter().copied());
        }
        reachable[index] = set;
    }

    let mut predecessors = vec![Vec::new(); count];
    for (from, targets) in successors.iter().enumerate() {
        for &to in targets {
            let implied = targets
                .iter()
                .any(|&other| other != to && reachable[other].contains(&to));
            if !implied {
                predecessors[to].push(from);
            }
        }
    }
    for list in &mut predecessors {
        list.sort_unstable();
    }
    predecessors
}
