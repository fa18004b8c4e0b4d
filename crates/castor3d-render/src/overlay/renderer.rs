//! Draws the overlays of one render target.
//!
//! A frame goes through [`OverlayRenderer::begin_prepare`], one
//! [`Preparer::visit`] per overlay, [`Preparer::end_prepare`],
//! [`OverlayRenderer::upload`] on a transfer command buffer the caller
//! submits first, then [`OverlayRenderer::render`].

use super::data::{OverlayId, PassId};
use super::pipeline::{PipelineCache, PipelineKey};
use super::pool::{OverlaySlot, OverlayVertexPools};
use super::preparer::Preparer;
use super::quad::{BorderQuad, PanelQuad, TextQuad};
use crate::component::RenderTechniqueVisitor;
use crate::passes::PassStep;
use crate::render_device::{memory_location, RenderDevice};
use castor3d_core::math::ortho_pixels;
use castor3d_core::OverlayConfig;
use castor3d_gpu::{
    color_range, vk, ColorAttachment, CommandsSemaphore, GpuError, GpuImage, QueueKind,
    RenderingDesc, Result, RetirementQueue, SemaphoreWait, SemaphoreWaitArray,
    UniformBufferOffset, UniformBufferPool,
};
use hashbrown::HashMap;

/// Projection shared by every overlay draw.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OverlayCameraUbo {
    pub projection: [[f32; 4]; 4],
    /// Target width and height in `xy`.
    pub size: [f32; 4],
}

impl OverlayCameraUbo {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            projection: ortho_pixels(extent.width, extent.height).to_cols_array_2d(),
            size: [extent.width as f32, extent.height as f32, 0.0, 0.0],
        }
    }
}

/// The colour image overlays are drawn into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl OverlayTarget {
    pub fn from_image(image: &GpuImage) -> Self {
        let extent = image.extent();
        Self {
            image: image.image(),
            view: image.view(),
            format: image.format(),
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        }
    }
}

/// Slots are keyed by overlay and material pass, so a multi-pass material
/// owns one slot per pass.
pub(crate) type SlotKey = (OverlayId, PassId);

/// A descriptor set waiting for the frames that bound it.
pub(crate) type RetiredSet = (PipelineKey, vk::DescriptorSet);

pub struct OverlayRenderer {
    pub(crate) render: RenderDevice,
    pub(crate) config: OverlayConfig,
    pub(crate) target: OverlayTarget,
    pub(crate) commands: CommandsSemaphore,
    fence: vk::Fence,
    /// A submission signalling `fence` has not been waited on yet.
    in_flight: bool,
    /// Frame being prepared.
    frame: u64,
    /// Last frame whose submission was waited on.
    completed_frame: Option<u64>,
    /// Commands were prepared and not submitted yet.
    pub(crate) awaiting_submit: bool,
    pub(crate) size_changed: bool,
    pub(crate) uniforms: UniformBufferPool,
    pub(crate) camera: UniformBufferOffset<OverlayCameraUbo>,
    pub(crate) panels: OverlayVertexPools<PanelQuad>,
    pub(crate) borders: OverlayVertexPools<BorderQuad>,
    pub(crate) texts: OverlayVertexPools<TextQuad>,
    pub(crate) panel_slots: HashMap<SlotKey, OverlaySlot>,
    pub(crate) border_slots: HashMap<SlotKey, OverlaySlot>,
    pub(crate) text_slots: HashMap<SlotKey, OverlaySlot>,
    pub(crate) pipelines: PipelineCache,
    pub(crate) retired: RetirementQueue<RetiredSet>,
}

impl OverlayRenderer {
    pub fn new(render: &RenderDevice, target: OverlayTarget, queue: QueueKind) -> Result<Self> {
        let device = render.device().clone();
        let config = render.config().overlays.clone();
        let vertex_location = memory_location(render.config().buffers.vertex_location);

        let commands = CommandsSemaphore::new(device.clone(), queue, "OverlayRenderer")?;
        let fence = device.create_fence(false)?;
        let mut uniforms = render.uniform_pool("OverlayRenderer");
        let camera = uniforms.get_buffer::<OverlayCameraUbo>()?;
        uniforms.write(&camera, &OverlayCameraUbo::new(target.extent))?;

        let renderer = Self {
            panels: OverlayVertexPools::new(device.clone(), &config, vertex_location)?,
            borders: OverlayVertexPools::new(device.clone(), &config, vertex_location)?,
            texts: OverlayVertexPools::new(device, &config, vertex_location)?,
            render: render.clone(),
            pipelines: PipelineCache::new(render.clone(), target.format),
            retired: RetirementQueue::new(render.config().retire_after()),
            config,
            target,
            commands,
            fence,
            in_flight: false,
            frame: 0,
            completed_frame: None,
            awaiting_submit: false,
            size_changed: true,
            uniforms,
            camera,
            panel_slots: HashMap::new(),
            border_slots: HashMap::new(),
            text_slots: HashMap::new(),
        };
        tracing::info!(
            width = target.extent.width,
            height = target.extent.height,
            batch = renderer.config.max_overlays_per_buffer,
            "Initialised overlay renderer"
        );
        Ok(renderer)
    }

    /// Draw into `target` from the next frame on.
    pub fn resize(&mut self, target: OverlayTarget) -> Result<()> {
        if target.extent != self.target.extent {
            self.uniforms
                .write(&self.camera, &OverlayCameraUbo::new(target.extent))?;
            self.size_changed = true;
        }
        self.target = target;
        Ok(())
    }

    /// Start recording the draws of `frame`.
    ///
    /// Waits for the previous submission, releases the descriptor sets
    /// retired up to the frame it completed and opens the rendering scope on
    /// the target.
    pub fn begin_prepare(&mut self, frame: u64) -> Result<Preparer<'_>> {
        if self.awaiting_submit {
            return Err(GpuError::InvalidState(
                "overlays prepared twice without being rendered".into(),
            ));
        }
        let device = self.render.device().clone();
        if self.in_flight {
            device.wait_for_fence(self.fence, u64::MAX)?;
            device.reset_fence(self.fence)?;
            self.in_flight = false;
            self.completed_frame = Some(self.frame);
        }
        if let Some(completed) = self.completed_frame {
            let pipelines = &mut self.pipelines;
            let released = self
                .retired
                .process_completed(completed, |(key, set)| pipelines.free_set(key, set))?;
            if released > 0 {
                tracing::debug!(released, completed, "Released retired overlay descriptor sets");
            }
        }
        self.frame = frame;

        let cb = self.commands.command_buffer();
        self.commands
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        PassStep::transition(
            self.target.image,
            color_range(1, 1),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .record(device.as_ref(), cb);
        device.cmd_begin_rendering(
            cb,
            &RenderingDesc {
                area: vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: self.target.extent,
                },
                layer_count: 1,
                color: &[ColorAttachment {
                    view: self.target.view,
                    clear: Some([0.0; 4]),
                }],
                depth: None,
            },
        );
        Ok(Preparer::new(self, frame))
    }

    /// Record the transfers of everything written while preparing.
    pub fn upload(&mut self, cb: vk::CommandBuffer) -> Result<bool> {
        let mut recorded = self.uniforms.upload(cb)?;
        recorded |= self.panels.upload(cb)?;
        recorded |= self.borders.upload(cb)?;
        recorded |= self.texts.upload(cb)?;
        Ok(recorded)
    }

    /// Submit the prepared draws after `to_wait`.
    pub fn render(&mut self, to_wait: &[SemaphoreWait]) -> Result<SemaphoreWaitArray> {
        if !self.awaiting_submit {
            return Err(GpuError::InvalidState("no prepared overlays to render".into()));
        }
        self.commands
            .submit_signalling(to_wait, &[], Some(self.fence))?;
        self.awaiting_submit = false;
        self.in_flight = true;
        Ok(vec![SemaphoreWait::new(
            self.commands.semaphore(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )])
    }

    pub fn target(&self) -> &OverlayTarget {
        &self.target
    }

    /// Whether the target size changed since the last completed preparation.
    pub fn size_changed(&self) -> bool {
        self.size_changed
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.command_buffer()
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.commands.semaphore()
    }

    pub fn panel_pools(&self) -> &OverlayVertexPools<PanelQuad> {
        &self.panels
    }

    pub fn border_pools(&self) -> &OverlayVertexPools<BorderQuad> {
        &self.borders
    }

    pub fn text_pools(&self) -> &OverlayVertexPools<TextQuad> {
        &self.texts
    }

    /// The panel slot of `pass` of `overlay`, if prepared and not reclaimed.
    pub fn panel_slot(&self, overlay: OverlayId, pass: PassId) -> Option<&OverlaySlot> {
        self.panel_slots.get(&(overlay, pass))
    }

    pub fn border_slot(&self, overlay: OverlayId, pass: PassId) -> Option<&OverlaySlot> {
        self.border_slots.get(&(overlay, pass))
    }

    pub fn text_slot(&self, overlay: OverlayId, pass: PassId) -> Option<&OverlaySlot> {
        self.text_slots.get(&(overlay, pass))
    }

    /// Live slots across the three shapes.
    pub fn slot_count(&self) -> usize {
        self.panel_slots.len() + self.border_slots.len() + self.text_slots.len()
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Descriptor sets waiting to be released.
    pub fn retired_count(&self) -> usize {
        self.retired.pending_count()
    }

    pub fn accept(&self, visitor: &mut dyn RenderTechniqueVisitor) {
        visitor.visit_pass("OverlayRenderer", "Overlays", true);
        visitor.visit_image("OverlayRenderer", "Target", self.target.image);
    }
}

impl Drop for OverlayRenderer {
    fn drop(&mut self) {
        let device = self.render.device().clone();
        if self.in_flight {
            if let Err(err) = device.wait_for_fence(self.fence, u64::MAX) {
                tracing::error!(%err, "Failed waiting for overlay submission");
            }
        }
        let pipelines = &mut self.pipelines;
        if let Err(err) = self
            .retired
            .flush(|(key, set)| pipelines.free_set(key, set))
        {
            tracing::error!(%err, "Failed releasing retired overlay descriptor sets");
        }
        device.destroy_fence(self.fence);
    }
}
