//! Execution of a compiled frame graph.
//!
//! Every enabled pass records into its own [`CommandsSemaphore`], one per
//! frame in flight, and is submitted in topological order once all of them
//! recorded. Binary semaphores are consumed by a single
//! wait, so a pass read by several consumers signals one semaphore per
//! consumer. A disabled pass is not submitted; its consumers wait on whatever
//! it would have waited on instead.

use super::builder::PassDesc;
use super::resource::PassId;
use castor3d_gpu::{
    CommandsSemaphore, Device, FrameTracker, GpuError, QueueKind, QueueSubmit, Result,
    SemaphoreWait, SemaphoreWaitArray,
};
use ash::vk;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State handed to a pass while it records.
pub struct RecordContext<'a> {
    pub device: &'a dyn Device,
    pub command_buffer: vk::CommandBuffer,
    /// Index of the frame being recorded.
    pub frame: u64,
    pub pass_name: &'a str,
}

/// Work recorded by one graph pass.
pub trait RunnablePass: Send {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()>;
}

impl<F> RunnablePass for F
where
    F: FnMut(&mut RecordContext<'_>) -> Result<()> + Send,
{
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// When a pass re-records its command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordMode {
    #[default]
    EveryFrame,
    /// Record on first use and resubmit the same commands until invalidated.
    Once,
}

/// Decides per frame whether a pass runs.
pub type EnabledCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// A shared switch usable as an [`EnabledCallback`].
#[derive(Debug, Clone, Default)]
pub struct EnabledFlag(Arc<AtomicBool>);

impl EnabledFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn callback(&self) -> EnabledCallback {
        let flag = self.0.clone();
        Box::new(move || flag.load(Ordering::Acquire))
    }
}

/// Commands and semaphores of one pass for one queue and frame slot.
struct PassCommands {
    queue: QueueKind,
    slot: usize,
    commands: CommandsSemaphore,
    /// Semaphores for the second and later consumers.
    extra_semaphores: Vec<vk::Semaphore>,
    recorded: bool,
}

struct CompiledPass {
    desc: PassDesc,
    predecessors: Vec<usize>,
    is_sink: bool,
    commands: Vec<PassCommands>,
}

impl CompiledPass {
    fn commands_for(&self, queue: QueueKind, slot: usize) -> Option<usize> {
        self.commands
            .iter()
            .position(|entry| entry.queue == queue && entry.slot == slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    External,
    Pass(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consumer {
    Pass(usize),
    Output,
}

/// A frame graph ready to run.
///
/// Frame `n` uses command set `n % frames_in_flight` of every pass. Before a
/// set is recorded again, the fence of the frame that last used it is waited
/// on, one [`FrameTracker`] per queue.
pub struct RunnableGraph {
    device: Arc<dyn Device>,
    name: String,
    passes: Vec<CompiledPass>,
    order: Vec<usize>,
    frames_in_flight: u32,
    trackers: Vec<(QueueKind, FrameTracker)>,
    /// Relays the caller's waits when several passes start the graph.
    relay: Vec<vk::Semaphore>,
    executed: Vec<PassId>,
}

impl RunnableGraph {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        name: String,
        descs: Vec<PassDesc>,
        order: Vec<usize>,
        predecessors: Vec<Vec<usize>>,
        frames_in_flight: u32,
    ) -> Result<Self> {
        let mut has_successor = vec![false; descs.len()];
        for list in &predecessors {
            for &from in list {
                has_successor[from] = true;
            }
        }

        let passes = descs
            .into_iter()
            .zip(predecessors)
            .zip(has_successor)
            .map(|((desc, predecessors), has_successor)| CompiledPass {
                desc,
                predecessors,
                is_sink: !has_successor,
                commands: Vec::new(),
            })
            .collect();

        Ok(Self {
            device,
            name,
            passes,
            order,
            frames_in_flight: frames_in_flight.max(1),
            trackers: Vec::new(),
            relay: Vec::new(),
            executed: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Passes in submission order.
    pub fn order(&self) -> Vec<PassId> {
        self.order.iter().map(|&index| PassId(index as u32)).collect()
    }

    pub fn pass_name(&self, id: PassId) -> Option<&str> {
        self.passes.get(id.index()).map(|pass| pass.desc.name.as_str())
    }

    pub fn pass_id(&self, name: &str) -> Option<PassId> {
        self.passes
            .iter()
            .position(|pass| pass.desc.name == name)
            .map(|index| PassId(index as u32))
    }

    /// Direct dependencies of `id` after redundant edges are removed.
    pub fn predecessors(&self, id: PassId) -> Vec<PassId> {
        self.passes
            .get(id.index())
            .map(|pass| {
                pass.predecessors
                    .iter()
                    .map(|&index| PassId(index as u32))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evaluate the pass's enabled callback.
    pub fn is_enabled(&self, id: PassId) -> bool {
        self.passes
            .get(id.index())
            .is_some_and(|pass| pass.desc.enabled.as_ref().map_or(true, |enabled| enabled()))
    }

    /// Force a [`RecordMode::Once`] pass to record again on its next run.
    pub fn invalidate(&mut self, id: PassId) {
        if let Some(pass) = self.passes.get_mut(id.index()) {
            for entry in &mut pass.commands {
                entry.recorded = false;
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        for pass in &mut self.passes {
            for entry in &mut pass.commands {
                entry.recorded = false;
            }
        }
    }

    /// Passes submitted by the last [`RunnableGraph::run`], in order.
    pub fn last_executed(&self) -> &[PassId] {
        &self.executed
    }

    /// Submit every enabled pass after `to_wait`, on `queue` unless the pass
    /// names its own.
    ///
    /// Every enabled pass is recorded before anything is submitted, so a
    /// recording error leaves no semaphore signalled. Returns the waits a
    /// consumer of the whole graph must honour. When no pass runs, `to_wait`
    /// is returned unchanged.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn run(
        &mut self,
        to_wait: &[SemaphoreWait],
        queue: QueueKind,
        frame: u64,
    ) -> Result<SemaphoreWaitArray> {
        let count = self.passes.len();
        let slot = (frame % u64::from(self.frames_in_flight)) as usize;
        let enabled: Vec<bool> = self
            .passes
            .iter()
            .map(|pass| pass.desc.enabled.as_ref().map_or(true, |enabled| enabled()))
            .collect();

        // What each pass waits on, and what waiting on it amounts to.
        let mut inputs: Vec<BTreeSet<Source>> = vec![BTreeSet::new(); count];
        let mut provides: Vec<BTreeSet<Source>> = vec![BTreeSet::new(); count];
        for &index in &self.order {
            let mut input = BTreeSet::new();
            if self.passes[index].predecessors.is_empty() {
                input.insert(Source::External);
            }
            for &from in &self.passes[index].predecessors {
                input.extend(provides[from].iter().copied());
            }
            provides[index] = if enabled[index] {
                BTreeSet::from([Source::Pass(index)])
            } else {
                input.clone()
            };
            inputs[index] = input;
        }

        let mut outputs = BTreeSet::new();
        if count == 0 {
            outputs.insert(Source::External);
        }
        for (index, pass) in self.passes.iter().enumerate() {
            if pass.is_sink {
                outputs.extend(provides[index].iter().copied());
            }
        }

        let mut consumers: BTreeMap<Source, Vec<Consumer>> = BTreeMap::new();
        for &index in &self.order {
            if enabled[index] {
                for &source in &inputs[index] {
                    consumers.entry(source).or_default().push(Consumer::Pass(index));
                }
            }
        }
        for &source in &outputs {
            consumers.entry(source).or_default().push(Consumer::Output);
        }

        // The last enabled pass on each queue carries that queue's fence.
        let mut last_on_queue: Vec<(QueueKind, usize)> = Vec::new();
        for &index in &self.order {
            if !enabled[index] {
                continue;
            }
            let pass_queue = self.passes[index].desc.queue.unwrap_or(queue);
            match last_on_queue.iter_mut().find(|(q, _)| *q == pass_queue) {
                Some(entry) => entry.1 = index,
                None => last_on_queue.push((pass_queue, index)),
            }
        }
        for &(pass_queue, _) in &last_on_queue {
            self.tracker(pass_queue)?.begin_frame_at(frame)?;
        }

        // Every enabled pass has at least one consumer: its successors or
        // the graph output.
        for position in 0..self.order.len() {
            let index = self.order[position];
            if enabled[index] {
                let pass_queue = self.passes[index].desc.queue.unwrap_or(queue);
                let needed = consumers
                    .get(&Source::Pass(index))
                    .map_or(0, Vec::len)
                    .saturating_sub(1);
                self.ensure_commands(index, pass_queue, slot, needed)?;
            }
        }

        let mut waits: Vec<Vec<SemaphoreWait>> = vec![Vec::new(); count];
        let mut output_waits = SemaphoreWaitArray::new();
        for (&source, list) in &consumers {
            for (consumer_slot, &consumer) in list.iter().enumerate() {
                let stage = match consumer {
                    Consumer::Pass(index) => self.passes[index].desc.wait_stage,
                    Consumer::Output => match source {
                        Source::Pass(producer) => self.passes[producer].desc.output_stage,
                        Source::External => vk::PipelineStageFlags::ALL_COMMANDS,
                    },
                };
                let granted: Vec<SemaphoreWait> = match source {
                    Source::Pass(producer) => {
                        vec![SemaphoreWait::new(
                            self.pass_semaphore(producer, queue, slot, consumer_slot)?,
                            stage,
                        )]
                    }
                    Source::External if list.len() == 1 => to_wait.to_vec(),
                    Source::External if to_wait.is_empty() => Vec::new(),
                    Source::External => {
                        self.ensure_relay(list.len())?;
                        vec![SemaphoreWait::new(self.relay[consumer_slot], stage)]
                    }
                };
                match consumer {
                    Consumer::Pass(index) => waits[index].extend(granted),
                    Consumer::Output => output_waits.extend(granted),
                }
            }
        }

        for position in 0..self.order.len() {
            let index = self.order[position];
            if enabled[index] {
                let pass_queue = self.passes[index].desc.queue.unwrap_or(queue);
                self.record_pass(index, pass_queue, slot, frame)?;
            }
        }

        if let Some(list) = consumers.get(&Source::External) {
            if list.len() > 1 && !to_wait.is_empty() {
                self.device.submit(
                    queue,
                    &QueueSubmit {
                        command_buffers: &[],
                        wait: to_wait,
                        signal: &self.relay[..list.len()],
                        fence: None,
                    },
                )?;
            }
        }

        self.executed.clear();
        for position in 0..self.order.len() {
            let index = self.order[position];
            if !enabled[index] {
                continue;
            }
            let signals = consumers.get(&Source::Pass(index)).map_or(1, Vec::len);
            let pass_queue = self.passes[index].desc.queue.unwrap_or(queue);
            let fenced = last_on_queue.contains(&(pass_queue, index));
            self.submit_pass(index, pass_queue, slot, &waits[index], signals, fenced)?;
            self.executed.push(PassId(index as u32));
        }

        tracing::trace!(
            graph = %self.name,
            frame,
            slot,
            submitted = self.executed.len(),
            outputs = output_waits.len(),
            "Ran frame graph"
        );
        Ok(output_waits)
    }

    fn tracker(&mut self, queue: QueueKind) -> Result<&mut FrameTracker> {
        let position = match self.trackers.iter().position(|(q, _)| *q == queue) {
            Some(position) => position,
            None => {
                let tracker = FrameTracker::new(self.device.clone(), self.frames_in_flight)?;
                self.trackers.push((queue, tracker));
                self.trackers.len() - 1
            }
        };
        Ok(&mut self.trackers[position].1)
    }

    /// Command set of pass `index` for `queue` and `slot`, with `extra`
    /// semaphores beyond its own.
    fn ensure_commands(
        &mut self,
        index: usize,
        queue: QueueKind,
        slot: usize,
        extra: usize,
    ) -> Result<()> {
        let device = &self.device;
        let pass = &mut self.passes[index];
        let position = match pass.commands_for(queue, slot) {
            Some(position) => position,
            None => {
                let commands = CommandsSemaphore::new(
                    device.clone(),
                    queue,
                    &format!("{}/{}", self.name, pass.desc.name),
                )?;
                pass.commands.push(PassCommands {
                    queue,
                    slot,
                    commands,
                    extra_semaphores: Vec::new(),
                    recorded: false,
                });
                pass.commands.len() - 1
            }
        };
        let entry = &mut pass.commands[position];
        while entry.extra_semaphores.len() < extra {
            let name = format!(
                "{}/{}/{}",
                self.name,
                pass.desc.name,
                entry.extra_semaphores.len() + 1
            );
            entry.extra_semaphores.push(device.create_semaphore(&name)?);
        }
        Ok(())
    }

    fn ensure_relay(&mut self, count: usize) -> Result<()> {
        while self.relay.len() < count {
            let name = format!("{}/Input/{}", self.name, self.relay.len());
            self.relay.push(self.device.create_semaphore(&name)?);
        }
        Ok(())
    }

    /// Semaphore signalled for the `consumer`-th consumer of pass `index`.
    fn pass_semaphore(
        &self,
        index: usize,
        queue: QueueKind,
        slot: usize,
        consumer: usize,
    ) -> Result<vk::Semaphore> {
        let pass = &self.passes[index];
        let pass_queue = pass.desc.queue.unwrap_or(queue);
        let entry = pass
            .commands_for(pass_queue, slot)
            .map(|position| &pass.commands[position])
            .ok_or_else(|| {
                GpuError::InvalidState(format!("pass {} has no commands", pass.desc.name))
            })?;
        if consumer == 0 {
            return Ok(entry.commands.semaphore());
        }
        entry
            .extra_semaphores
            .get(consumer - 1)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "pass {} has no semaphore for consumer {consumer}",
                    pass.desc.name
                ))
            })
    }

    fn record_pass(
        &mut self,
        index: usize,
        queue: QueueKind,
        slot: usize,
        frame: u64,
    ) -> Result<()> {
        let device = &*self.device;
        let pass = &mut self.passes[index];
        let position = pass.commands_for(queue, slot).ok_or_else(|| {
            GpuError::InvalidState(format!("pass {} has no commands", pass.desc.name))
        })?;
        let entry = &mut pass.commands[position];

        let (record, flags) = match pass.desc.record_mode {
            RecordMode::EveryFrame => (true, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            RecordMode::Once => (!entry.recorded, vk::CommandBufferUsageFlags::empty()),
        };
        if !record {
            return Ok(());
        }

        entry.recorded = false;
        entry.commands.begin(flags)?;
        let mut ctx = RecordContext {
            device,
            command_buffer: entry.commands.command_buffer(),
            frame,
            pass_name: &pass.desc.name,
        };
        let recorded = pass.desc.runnable.record(&mut ctx);
        let ended = entry.commands.end();
        recorded?;
        ended?;
        entry.recorded = true;
        Ok(())
    }

    fn submit_pass(
        &mut self,
        index: usize,
        queue: QueueKind,
        slot: usize,
        waits: &[SemaphoreWait],
        signals: usize,
        fenced: bool,
    ) -> Result<()> {
        let pass = &self.passes[index];
        let position = pass.commands_for(queue, slot).ok_or_else(|| {
            GpuError::InvalidState(format!("pass {} has no commands", pass.desc.name))
        })?;
        let fence = if fenced {
            Some(self.tracker(queue)?.frame_fence())
        } else {
            None
        };
        let entry = &self.passes[index].commands[position];

        let extra = &entry.extra_semaphores[..signals.saturating_sub(1)];
        let submitted = entry.commands.submit_signalling(waits, extra, fence);
        if submitted.is_err() && fenced {
            self.tracker(queue)?.abandon_frame();
        }
        submitted?;
        tracing::trace!(
            pass = %self.passes[index].desc.name,
            waits = waits.len(),
            signals,
            fenced,
            "Submitted pass"
        );
        Ok(())
    }
}

impl Drop for RunnableGraph {
    fn drop(&mut self) {
        // Waits on every frame still in flight.
        self.trackers.clear();
        for pass in &mut self.passes {
            for entry in &mut pass.commands {
                for semaphore in entry.extra_semaphores.drain(..) {
                    self.device.destroy_semaphore(semaphore);
                }
            }
        }
        for semaphore in self.relay.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FrameGraph;
    use castor3d_gpu::mock::MockDevice;
    use parking_lot::Mutex;

    fn dispatch(ctx: &mut RecordContext<'_>) -> Result<()> {
        ctx.device.cmd_dispatch(ctx.command_buffer, 1, 1, 1);
        Ok(())
    }

    fn chain(device: Arc<MockDevice>, flag: &EnabledFlag) -> RunnableGraph {
        let mut graph = FrameGraph::new("Chain");
        let a = graph.add_image("A");
        let b = graph.add_image("B");
        let c = graph.add_image("C");
        graph.add_pass(
            PassDesc::new("First", dispatch)
                .writes(a)
                .output_stage(vk::PipelineStageFlags::COMPUTE_SHADER),
        );
        graph.add_pass(
            PassDesc::new("Second", dispatch)
                .reads(a)
                .writes(b)
                .wait_stage(vk::PipelineStageFlags::COMPUTE_SHADER)
                .output_stage(vk::PipelineStageFlags::FRAGMENT_SHADER),
        );
        graph.add_pass(
            PassDesc::new("Third", dispatch)
                .reads(b)
                .writes(c)
                .wait_stage(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .enabled_if(flag.callback()),
        );
        graph.compile(device).unwrap()
    }

    #[test]
    fn linear_chain_waits_on_the_previous_stage() {
        let device = Arc::new(MockDevice::new());
        let flag = EnabledFlag::new(true);
        let mut graph = chain(device.clone(), &flag);

        let out = graph.run(&[], QueueKind::Graphics, 0).unwrap();
        let submissions = device.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(submissions[0].waits.is_empty());
        assert_eq!(submissions[1].waits[0].semaphore, submissions[0].signals[0]);
        assert_eq!(submissions[2].waits[0].semaphore, submissions[1].signals[0]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].semaphore, submissions[2].signals[0]);
        device.consume_waits(&out).unwrap();
        assert!(device.violations().is_empty());
    }

    #[test]
    fn disabled_stage_forwards_its_predecessor() {
        let device = Arc::new(MockDevice::new());
        let flag = EnabledFlag::new(false);
        let mut graph = chain(device.clone(), &flag);

        let out = graph.run(&[], QueueKind::Graphics, 0).unwrap();
        let submissions = device.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(
            out,
            vec![SemaphoreWait::new(
                submissions[1].signals[0],
                vk::PipelineStageFlags::FRAGMENT_SHADER
            )]
        );
        device.consume_waits(&out).unwrap();

        // Re-enabling takes effect on the next frame.
        flag.set(true);
        let out = graph.run(&[], QueueKind::Graphics, 1).unwrap();
        assert_eq!(graph.last_executed().len(), 3);
        device.consume_waits(&out).unwrap();
    }

    #[test]
    fn fan_out_signals_one_semaphore_per_consumer() {
        let device = Arc::new(MockDevice::new());
        let mut graph = FrameGraph::new("FanOut");
        let source = graph.add_buffer("Source");
        let left = graph.add_image("Left");
        let right = graph.add_image("Right");
        graph.add_pass(PassDesc::new("Produce", dispatch).writes(source));
        graph.add_pass(PassDesc::new("Left", dispatch).reads(source).writes(left));
        graph.add_pass(PassDesc::new("Right", dispatch).reads(source).writes(right));
        let mut graph = graph.compile(device.clone()).unwrap();

        let out = graph.run(&[], QueueKind::Compute, 0).unwrap();
        let submissions = device.submissions();
        assert_eq!(submissions[0].signals.len(), 2);
        assert_ne!(
            submissions[1].waits[0].semaphore,
            submissions[2].waits[0].semaphore
        );
        assert_eq!(out.len(), 2);
        device.consume_waits(&out).unwrap();
        assert!(device.violations().is_empty());

        // The same semaphores are reusable on the next frame.
        let out = graph.run(&[], QueueKind::Compute, 1).unwrap();
        device.consume_waits(&out).unwrap();
    }

    #[test]
    fn shared_input_is_relayed() {
        let device = Arc::new(MockDevice::new());
        let upstream = device.create_semaphore("Upstream").unwrap();
        device.signal_semaphore(upstream).unwrap();

        let mut graph = FrameGraph::new("Roots");
        let left = graph.add_image("Left");
        let right = graph.add_image("Right");
        graph.add_pass(PassDesc::new("Left", dispatch).writes(left));
        graph.add_pass(PassDesc::new("Right", dispatch).writes(right));
        let mut graph = graph.compile(device.clone()).unwrap();

        let wait = [SemaphoreWait::new(
            upstream,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )];
        let out = graph.run(&wait, QueueKind::Graphics, 0).unwrap();
        let submissions = device.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(submissions[0].command_buffers.is_empty());
        assert_eq!(submissions[0].waits, wait.to_vec());
        assert_eq!(submissions[0].signals.len(), 2);
        device.consume_waits(&out).unwrap();
        assert!(device.violations().is_empty());
    }

    #[test]
    fn all_disabled_returns_input() {
        let device = Arc::new(MockDevice::new());
        let flag = EnabledFlag::new(false);
        let mut graph = FrameGraph::new("Off");
        graph.add_pass(PassDesc::new("Only", dispatch).enabled_if(flag.callback()));
        let mut graph = graph.compile(device.clone()).unwrap();

        let wait = [SemaphoreWait::new(
            vk::Semaphore::null(),
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )];
        let out = graph.run(&wait, QueueKind::Graphics, 0).unwrap();
        assert_eq!(out, wait.to_vec());
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn record_once_reuses_commands() {
        let device = Arc::new(MockDevice::new());
        let records = Arc::new(Mutex::new(0u32));
        let counter = records.clone();
        let mut graph = FrameGraph::new("Once");
        let pass = graph.add_pass(
            PassDesc::new("Static", move |ctx: &mut RecordContext<'_>| {
                *counter.lock() += 1;
                dispatch(ctx)
            })
            .record_mode(RecordMode::Once),
        );
        let mut graph = graph.compile(device.clone()).unwrap();

        // Once per frame slot.
        for frame in 0..4 {
            let out = graph.run(&[], QueueKind::Graphics, frame).unwrap();
            device.consume_waits(&out).unwrap();
        }
        assert_eq!(*records.lock(), 2);

        graph.invalidate(pass);
        let out = graph.run(&[], QueueKind::Graphics, 4).unwrap();
        device.consume_waits(&out).unwrap();
        assert_eq!(*records.lock(), 3);
    }

    #[test]
    fn failed_stage_submits_nothing() {
        let device = Arc::new(MockDevice::new());
        let fail = Arc::new(AtomicBool::new(true));
        let should_fail = fail.clone();
        let mut graph = FrameGraph::new("Flaky");
        let a = graph.add_image("A");
        let b = graph.add_image("B");
        graph.add_pass(PassDesc::new("First", dispatch).writes(a));
        graph.add_pass(
            PassDesc::new("Second", move |ctx: &mut RecordContext<'_>| {
                if should_fail.load(Ordering::Relaxed) {
                    return Err(GpuError::Other("recording failed".into()));
                }
                dispatch(ctx)
            })
            .reads(a)
            .writes(b),
        );
        graph.add_pass(PassDesc::new("Third", dispatch).reads(b));
        let mut graph = graph.compile(device.clone()).unwrap();

        assert!(graph.run(&[], QueueKind::Graphics, 0).is_err());
        assert_eq!(device.submission_count(), 0);
        assert!(graph.last_executed().is_empty());

        fail.store(false, Ordering::Relaxed);
        for frame in 0..3 {
            let out = graph.run(&[], QueueKind::Graphics, frame).unwrap();
            device.consume_waits(&out).unwrap();
        }
        assert_eq!(device.submission_count(), 9);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn frames_in_flight_record_into_their_own_commands() {
        let device = Arc::new(MockDevice::new());
        let flag = EnabledFlag::new(true);
        let mut graph = chain(device.clone(), &flag);
        assert_eq!(graph.frames_in_flight(), 2);

        for frame in 0..3 {
            let out = graph.run(&[], QueueKind::Graphics, frame).unwrap();
            device.consume_waits(&out).unwrap();
        }
        let submissions = device.submissions();
        assert_eq!(submissions.len(), 9);
        let buffers_of = |frame: usize| -> Vec<vk::CommandBuffer> {
            submissions[frame * 3..frame * 3 + 3]
                .iter()
                .flat_map(|submission| submission.command_buffers.clone())
                .collect()
        };
        let (first, second, third) = (buffers_of(0), buffers_of(1), buffers_of(2));
        assert!(first.iter().all(|cb| !second.contains(cb)));
        assert_eq!(first, third);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn last_submission_of_a_frame_carries_the_slot_fence() {
        let device = Arc::new(MockDevice::new());
        let flag = EnabledFlag::new(true);
        let mut graph = chain(device.clone(), &flag);

        for frame in 0..3 {
            let out = graph.run(&[], QueueKind::Graphics, frame).unwrap();
            device.consume_waits(&out).unwrap();
        }
        let fences: Vec<Option<vk::Fence>> = device
            .submissions()
            .iter()
            .map(|submission| submission.fence)
            .collect();
        for frame in 0..3 {
            assert!(fences[frame * 3].is_none());
            assert!(fences[frame * 3 + 1].is_none());
            assert!(fences[frame * 3 + 2].is_some());
        }
        assert_ne!(fences[2], fences[5]);
        // Reusing the fence means frame 0 was waited on and the fence reset.
        assert_eq!(fences[2], fences[8]);
    }

    #[test]
    fn single_frame_in_flight_reuses_one_command_set() {
        let device = Arc::new(MockDevice::new());
        let mut graph = FrameGraph::new("Single").with_frames_in_flight(1);
        graph.add_pass(PassDesc::new("Only", dispatch));
        let mut graph = graph.compile(device.clone()).unwrap();

        for frame in 0..3 {
            let out = graph.run(&[], QueueKind::Graphics, frame).unwrap();
            device.consume_waits(&out).unwrap();
        }
        let submissions = device.submissions();
        assert_eq!(submissions[0].command_buffers, submissions[2].command_buffers);
        assert_eq!(device.live_command_buffer_count(), 1);
    }

    #[test]
    fn dropping_releases_semaphores() {
        let device = Arc::new(MockDevice::new());
        let mut graph = FrameGraph::new("Drop");
        let source = graph.add_buffer("Source");
        graph.add_pass(PassDesc::new("Produce", dispatch).writes(source));
        graph.add_pass(PassDesc::new("A", dispatch).reads(source));
        graph.add_pass(PassDesc::new("B", dispatch).reads(source));
        let mut graph = graph.compile(device.clone()).unwrap();
        let out = graph.run(&[], QueueKind::Graphics, 0).unwrap();
        device.consume_waits(&out).unwrap();
        drop(graph);
        assert_eq!(device.live_semaphore_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
    }
}
