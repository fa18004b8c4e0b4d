//! A host-memory [`Device`] for tests.
//!
//! [`MockDevice`] hands out unique fake handles, keeps buffer contents in host
//! memory and records every command. Submissions execute instantly: buffer
//! copies and fills are applied, signal semaphores become pending and fences
//! become signaled. Binary semaphore rules are enforced, so a chain that
//! waits on a semaphore nobody signaled, or signals one twice without a wait
//! in between, fails its submission.
//!
//! Recording into a command buffer that is not recording is not fatal; it is
//! logged and kept in [`MockDevice::violations`].

use crate::buffer::is_host_visible;
use crate::device::{
    BufferBarrier, BufferDesc, ColorAttachment, DepthAttachment, DescriptorBinding,
    DescriptorWrite, Device, DeviceLimits, ImageBarrier, ImageDesc, ImageViewDesc, QueueKind,
    QueueSubmit, RenderingDesc, SamplerDesc,
};
use crate::error::{GpuError, Result};
use crate::pipeline::{GraphicsPipelineConfig, Pipeline};
use crate::sync::SemaphoreWait;
use ash::vk::{self, Handle};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A command recorded by [`MockDevice`].
#[derive(Debug, Clone)]
pub enum MockCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    FillBuffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
    BufferBarrier(BufferBarrier),
    ImageBarrier(ImageBarrier),
    BeginRendering {
        area: vk::Rect2D,
        layer_count: u32,
        color: Vec<ColorAttachment>,
        depth: Option<DepthAttachment>,
    },
    EndRendering,
    BindPipeline(Pipeline),
    BindDescriptorSet {
        index: u32,
        set: vk::DescriptorSet,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        data: Vec<u8>,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        region: vk::ImageBlit,
        filter: vk::Filter,
    },
    ClearColorImage {
        image: vk::Image,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    },
}

/// A submission as seen by [`MockDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockSubmission {
    pub queue: QueueKind,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

/// Creation parameters of a live mock image.
#[derive(Debug, Clone, PartialEq)]
pub struct MockImageInfo {
    pub name: String,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

struct MockBuffer {
    name: String,
    data: Vec<u8>,
    host_visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
    Invalid,
}

struct MockCommandBuffer {
    queue: QueueKind,
    state: RecordState,
    one_time: bool,
    commands: Vec<MockCommand>,
}

struct MockSemaphore {
    name: String,
    pending: bool,
}

#[derive(Default)]
struct State {
    buffers: HashMap<vk::Buffer, MockBuffer>,
    images: HashMap<vk::Image, MockImageInfo>,
    views: HashMap<vk::ImageView, vk::Image>,
    samplers: HashSet<vk::Sampler>,
    set_layouts: HashSet<vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<vk::DescriptorPool, Vec<vk::DescriptorSet>>,
    descriptor_sets: HashMap<vk::DescriptorSet, Vec<DescriptorWrite>>,
    pipelines: HashMap<vk::Pipeline, vk::PipelineLayout>,
    pipeline_creations: usize,
    semaphores: HashMap<vk::Semaphore, MockSemaphore>,
    fences: HashMap<vk::Fence, bool>,
    command_buffers: HashMap<vk::CommandBuffer, MockCommandBuffer>,
    submissions: Vec<MockSubmission>,
    violations: Vec<String>,
    fail_next_buffer: bool,
    fail_next_pipeline: bool,
}

impl State {
    fn violation(&mut self, message: String) {
        tracing::error!(%message, "Mock device usage violation");
        self.violations.push(message);
    }

    fn record(&mut self, cb: vk::CommandBuffer, command: MockCommand) {
        match self.command_buffers.get_mut(&cb) {
            Some(buffer) if buffer.state == RecordState::Recording => {
                buffer.commands.push(command);
            }
            Some(buffer) => {
                let state = buffer.state;
                self.violation(format!("{command:?} recorded into {cb:?} in state {state:?}"));
            }
            None => self.violation(format!("{command:?} recorded into unknown {cb:?}")),
        }
    }

    fn execute(&mut self, command: &MockCommand) {
        match command {
            MockCommand::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let source = self.buffers.get(src).and_then(|buffer| {
                        let start = region.src_offset as usize;
                        buffer
                            .data
                            .get(start..start + region.size as usize)
                            .map(<[u8]>::to_vec)
                    });
                    let written = source.and_then(|bytes| {
                        let target = self.buffers.get_mut(dst)?;
                        let start = region.dst_offset as usize;
                        target
                            .data
                            .get_mut(start..start + bytes.len())
                            .map(|slice| slice.copy_from_slice(&bytes))
                    });
                    if written.is_none() {
                        self.violation(format!("copy {region:?} from {src:?} to {dst:?} is out of bounds"));
                    }
                }
            }
            MockCommand::FillBuffer {
                buffer,
                offset,
                size,
                data,
            } => {
                let Some(target) = self.buffers.get_mut(buffer) else {
                    self.violation(format!("fill of unknown {buffer:?}"));
                    return;
                };
                let start = *offset as usize;
                let end = if *size == vk::WHOLE_SIZE {
                    target.data.len()
                } else {
                    start + *size as usize
                };
                match target.data.get_mut(start..end) {
                    Some(slice) => {
                        for (index, byte) in slice.iter_mut().enumerate() {
                            *byte = data.to_le_bytes()[index % 4];
                        }
                    }
                    None => self.violation(format!("fill {start}..{end} of {buffer:?} is out of bounds")),
                }
            }
            _ => {}
        }
    }
}

/// A [`Device`] living entirely in host memory.
pub struct MockDevice {
    limits: DeviceLimits,
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Make the next buffer creation fail with an out-of-memory error.
    pub fn fail_next_buffer_creation(&self) {
        self.state.lock().fail_next_buffer = true;
    }

    /// Make the next pipeline creation fail.
    pub fn fail_next_pipeline_creation(&self) {
        self.state.lock().fail_next_pipeline = true;
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn buffer_name(&self, buffer: vk::Buffer) -> Option<String> {
        self.state.lock().buffers.get(&buffer).map(|b| b.name.clone())
    }

    pub fn image_info(&self, image: vk::Image) -> Option<MockImageInfo> {
        self.state.lock().images.get(&image).cloned()
    }

    /// Commands recorded since the command buffer was last begun.
    pub fn recorded_commands(&self, cb: vk::CommandBuffer) -> Vec<MockCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&cb)
            .map(|buffer| buffer.commands.clone())
            .unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.state
            .lock()
            .descriptor_sets
            .get(&set)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_image_view_count(&self) -> usize {
        self.state.lock().views.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_descriptor_set_count(&self) -> usize {
        self.state.lock().descriptor_sets.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    /// Graphics and compute pipelines created so far, destroyed ones included.
    pub fn pipeline_creation_count(&self) -> usize {
        self.state.lock().pipeline_creations
    }

    pub fn is_buffer_alive(&self, buffer: vk::Buffer) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    pub fn is_image_alive(&self, image: vk::Image) -> bool {
        self.state.lock().images.contains_key(&image)
    }

    pub fn semaphore_name(&self, semaphore: vk::Semaphore) -> Option<String> {
        self.state
            .lock()
            .semaphores
            .get(&semaphore)
            .map(|s| s.name.clone())
    }

    /// Whether a signal on `semaphore` is waiting to be consumed.
    pub fn is_semaphore_pending(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .semaphores
            .get(&semaphore)
            .is_some_and(|s| s.pending)
    }

    /// Signal a semaphore from outside any queue, as a presentation engine would.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .semaphores
            .get_mut(&semaphore)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{semaphore:?}")))?;
        if entry.pending {
            return Err(GpuError::InvalidState(format!(
                "semaphore {} signaled twice",
                entry.name
            )));
        }
        entry.pending = true;
        Ok(())
    }

    /// Consume waits as a final consumer of a chain would.
    pub fn consume_waits(&self, waits: &[SemaphoreWait]) -> Result<()> {
        let mut state = self.state.lock();
        for wait in waits {
            match state.semaphores.get_mut(&wait.semaphore) {
                Some(entry) if entry.pending => entry.pending = false,
                Some(entry) => {
                    return Err(GpuError::InvalidState(format!(
                        "wait on unsignaled semaphore {}",
                        entry.name
                    )))
                }
                None => return Err(GpuError::InvalidHandle(format!("{:?}", wait.semaphore))),
            }
        }
        Ok(())
    }

    /// Misuses recorded so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }
}

impl Device for MockDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_buffer) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }
        if desc.size == 0 {
            return Err(GpuError::InvalidState(format!("buffer {} has zero size", desc.name)));
        }
        let buffer = self.handle();
        state.buffers.insert(
            buffer,
            MockBuffer {
                name: desc.name.to_owned(),
                data: vec![0; desc.size as usize],
                host_visible: is_host_visible(desc.location),
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_none() {
            state.violation(format!("destroy of unknown {buffer:?}"));
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let target = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if !target.host_visible {
            return Err(GpuError::InvalidState(format!(
                "buffer {} is not host visible",
                target.name
            )));
        }
        let start = offset as usize;
        target
            .data
            .get_mut(start..start + data.len())
            .ok_or_else(|| GpuError::InvalidState(format!("write past the end of {}", target.name)))?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let source = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if !source.host_visible {
            return Err(GpuError::InvalidState(format!(
                "buffer {} is not host visible",
                source.name
            )));
        }
        let start = offset as usize;
        let bytes = source
            .data
            .get(start..start + out.len())
            .ok_or_else(|| GpuError::InvalidState(format!("read past the end of {}", source.name)))?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || desc.mip_levels == 0 {
            return Err(GpuError::InvalidState(format!(
                "image {} has an empty extent or no mip level",
                desc.name
            )));
        }
        let image = self.handle();
        self.state.lock().images.insert(
            image,
            MockImageInfo {
                name: desc.name.to_owned(),
                image_type: desc.image_type,
                format: desc.format,
                extent,
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
                usage: desc.usage,
            },
        );
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_none() {
            state.violation(format!("destroy of unknown {image:?}"));
        }
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&desc.image) {
            return Err(GpuError::InvalidHandle(format!("view of unknown {:?}", desc.image)));
        }
        let view = self.handle();
        state.views.insert(view, desc.image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().views.remove(&view);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        let sampler = self.handle();
        self.state.lock().samplers.insert(sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout = self.handle();
        self.state.lock().set_layouts.insert(layout);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().set_layouts.remove(&layout);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let pool = self.handle();
        self.state.lock().descriptor_pools.insert(pool, Vec::new());
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if let Some(sets) = state.descriptor_pools.remove(&pool) {
            for set in sets {
                state.descriptor_sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if !state.set_layouts.contains(&layout) {
            return Err(GpuError::InvalidHandle(format!("{layout:?}")));
        }
        let set = self.handle();
        state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{pool:?}")))?
            .push(set);
        state.descriptor_sets.insert(set, Vec::new());
        Ok(set)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        let mut state = self.state.lock();
        let sets = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{pool:?}")))?;
        let position = sets
            .iter()
            .position(|&s| s == set)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{set:?}")))?;
        sets.swap_remove(position);
        state.descriptor_sets.remove(&set);
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        match state.descriptor_sets.get_mut(&set) {
            Some(current) => {
                for write in writes {
                    current.retain(|w| w.binding() != write.binding());
                    current.push(*write);
                }
            }
            None => state.violation(format!("update of unknown {set:?}")),
        }
    }

    fn create_graphics_pipeline(
        &self,
        _config: &GraphicsPipelineConfig,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_pipeline) {
            return Err(GpuError::PipelineCreation("injected failure".into()));
        }
        let pipeline = Pipeline {
            pipeline: self.handle(),
            layout: self.handle(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        };
        state.pipelines.insert(pipeline.pipeline, pipeline.layout);
        state.pipeline_creations += 1;
        Ok(pipeline)
    }

    fn create_compute_pipeline(
        &self,
        _shader: &[u32],
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_pipeline) {
            return Err(GpuError::PipelineCreation("injected failure".into()));
        }
        let pipeline = Pipeline {
            pipeline: self.handle(),
            layout: self.handle(),
            bind_point: vk::PipelineBindPoint::COMPUTE,
        };
        state.pipelines.insert(pipeline.pipeline, pipeline.layout);
        state.pipeline_creations += 1;
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: &Pipeline) {
        let mut state = self.state.lock();
        if state.pipelines.remove(&pipeline.pipeline).is_none() {
            state.violation(format!("destroy of unknown {:?}", pipeline.pipeline));
        }
    }

    fn create_semaphore(&self, name: &str) -> Result<vk::Semaphore> {
        let semaphore = self.handle();
        self.state.lock().semaphores.insert(
            semaphore,
            MockSemaphore {
                name: name.to_owned(),
                pending: false,
            },
        );
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore).is_none() {
            state.violation(format!("destroy of unknown {semaphore:?}"));
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = self.handle();
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        match self.state.lock().fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(vk::Result::TIMEOUT.into()),
            None => Err(GpuError::InvalidHandle(format!("{fence:?}"))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))?;
        *signaled = false;
        Ok(())
    }

    fn is_fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::InvalidHandle(format!("{fence:?}")))
    }

    fn allocate_command_buffer(&self, queue: QueueKind) -> Result<vk::CommandBuffer> {
        let cb = self.handle();
        self.state.lock().command_buffers.insert(
            cb,
            MockCommandBuffer {
                queue,
                state: RecordState::Initial,
                one_time: false,
                commands: Vec::new(),
            },
        );
        Ok(cb)
    }

    fn free_command_buffer(&self, queue: QueueKind, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        match state.command_buffers.remove(&command_buffer) {
            Some(buffer) if buffer.queue != queue => state.violation(format!(
                "{command_buffer:?} from {:?} freed to {queue:?}",
                buffer.queue
            )),
            Some(_) => {}
            None => state.violation(format!("free of unknown {command_buffer:?}")),
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{command_buffer:?}")))?;
        if buffer.state == RecordState::Recording {
            return Err(GpuError::InvalidState(format!(
                "{command_buffer:?} is already recording"
            )));
        }
        buffer.state = RecordState::Recording;
        buffer.one_time = flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        buffer.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{command_buffer:?}")))?;
        if buffer.state != RecordState::Recording {
            return Err(GpuError::InvalidState(format!(
                "{command_buffer:?} ended while not recording"
            )));
        }
        buffer.state = RecordState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.state.lock().record(
            cb,
            MockCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_fill_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        self.state.lock().record(
            cb,
            MockCommand::FillBuffer {
                buffer,
                offset,
                size,
                data,
            },
        );
    }

    fn cmd_buffer_barrier(&self, cb: vk::CommandBuffer, barrier: &BufferBarrier) {
        self.state
            .lock()
            .record(cb, MockCommand::BufferBarrier(*barrier));
    }

    fn cmd_image_barrier(&self, cb: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.state
            .lock()
            .record(cb, MockCommand::ImageBarrier(*barrier));
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, desc: &RenderingDesc<'_>) {
        self.state.lock().record(
            cb,
            MockCommand::BeginRendering {
                area: desc.area,
                layer_count: desc.layer_count,
                color: desc.color.to_vec(),
                depth: desc.depth,
            },
        );
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        self.state.lock().record(cb, MockCommand::EndRendering);
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: &Pipeline) {
        self.state
            .lock()
            .record(cb, MockCommand::BindPipeline(*pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        _pipeline: &Pipeline,
        index: u32,
        set: vk::DescriptorSet,
    ) {
        self.state
            .lock()
            .record(cb, MockCommand::BindDescriptorSet { index, set });
    }

    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        _pipeline: &Pipeline,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.state.lock().record(
            cb,
            MockCommand::PushConstants {
                stages,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(
        &self,
        cb: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        self.state.lock().record(
            cb,
            MockCommand::BindVertexBuffer {
                binding,
                buffer,
                offset,
            },
        );
    }

    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state
            .lock()
            .record(cb, MockCommand::SetViewport(viewport));
    }

    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state.lock().record(cb, MockCommand::SetScissor(scissor));
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.state.lock().record(
            cb,
            MockCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state
            .lock()
            .record(cb, MockCommand::Dispatch { x, y, z });
    }

    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    ) {
        self.state.lock().record(
            cb,
            MockCommand::BlitImage {
                src,
                dst,
                region: *region,
                filter,
            },
        );
    }

    fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    ) {
        self.state
            .lock()
            .record(cb, MockCommand::ClearColorImage { image, color, range });
    }

    fn submit(&self, queue: QueueKind, submit: &QueueSubmit<'_>) -> Result<()> {
        let mut state = self.state.lock();

        for cb in submit.command_buffers {
            match state.command_buffers.get(cb) {
                Some(buffer) if buffer.state == RecordState::Executable => {}
                Some(buffer) => {
                    return Err(GpuError::InvalidState(format!(
                        "{cb:?} submitted in state {:?}",
                        buffer.state
                    )))
                }
                None => return Err(GpuError::InvalidHandle(format!("{cb:?}"))),
            }
        }
        for wait in submit.wait {
            match state.semaphores.get(&wait.semaphore) {
                Some(entry) if entry.pending => {}
                Some(entry) => {
                    return Err(GpuError::InvalidState(format!(
                        "submission waits on unsignaled semaphore {}",
                        entry.name
                    )))
                }
                None => return Err(GpuError::InvalidHandle(format!("{:?}", wait.semaphore))),
            }
        }
        for semaphore in submit.signal {
            let waited = submit.wait.iter().any(|w| w.semaphore == *semaphore);
            match state.semaphores.get(semaphore) {
                Some(entry) if entry.pending && !waited => {
                    return Err(GpuError::InvalidState(format!(
                        "semaphore {} signaled again before being waited on",
                        entry.name
                    )))
                }
                Some(_) => {}
                None => return Err(GpuError::InvalidHandle(format!("{semaphore:?}"))),
            }
        }
        if let Some(fence) = submit.fence {
            match state.fences.get(&fence) {
                Some(false) => {}
                Some(true) => {
                    return Err(GpuError::InvalidState(format!(
                        "{fence:?} submitted while signaled"
                    )))
                }
                None => return Err(GpuError::InvalidHandle(format!("{fence:?}"))),
            }
        }

        for wait in submit.wait {
            if let Some(entry) = state.semaphores.get_mut(&wait.semaphore) {
                entry.pending = false;
            }
        }
        for cb in submit.command_buffers {
            let commands = state
                .command_buffers
                .get(cb)
                .map(|buffer| buffer.commands.clone())
                .unwrap_or_default();
            for command in &commands {
                state.execute(command);
            }
            if let Some(buffer) = state.command_buffers.get_mut(cb) {
                if buffer.one_time {
                    buffer.state = RecordState::Invalid;
                }
            }
        }
        for semaphore in submit.signal {
            if let Some(entry) = state.semaphores.get_mut(semaphore) {
                entry.pending = true;
            }
        }
        if let Some(fence) = submit.fence {
            state.fences.insert(fence, true);
        }

        state.submissions.push(MockSubmission {
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            waits: submit.wait.to_vec(),
            signals: submit.signal.to_vec(),
            fence: submit.fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}
