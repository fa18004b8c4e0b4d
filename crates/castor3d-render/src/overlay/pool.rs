//! Vertex slots plus per-overlay uniforms for one overlay shape.

use super::pipeline::PipelineKey;
use super::quad::OverlayQuad;
use castor3d_core::OverlayConfig;
use castor3d_gpu::{
    vk, Device, MemoryLocation, Result, UniformBufferOffset, UniformBufferPool, VertexBufferPool,
    VertexPoolDesc, VertexSlot,
};
use std::marker::PhantomData;
use std::sync::Arc;

/// Per-overlay shader data.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OverlayUbo {
    /// Absolute position in `xy`, absolute size in `zw`, in pixels.
    pub position_size: [f32; 4],
    pub colour: [f32; 4],
    /// Target width and height, material pass index and opacity bits.
    pub render_size_pass: [u32; 4],
}

/// Everything one overlay pass owns in the pools.
#[derive(Debug)]
pub struct OverlaySlot {
    pub(crate) vertices: VertexSlot,
    pub(crate) ubo: UniformBufferOffset<OverlayUbo>,
    pub(crate) descriptor_set: Option<vk::DescriptorSet>,
    pub(crate) pipeline_key: Option<PipelineKey>,
    /// Texture views then font view the descriptor set was written with.
    pub(crate) views: Vec<vk::ImageView>,
    pub(crate) vertex_count: u32,
    /// Frame of the last `visit`; slots not visited in a frame are reclaimed.
    pub(crate) last_frame: u64,
}

impl OverlaySlot {
    pub fn vertices(&self) -> &VertexSlot {
        &self.vertices
    }

    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.descriptor_set
    }

    pub fn pipeline_key(&self) -> Option<PipelineKey> {
        self.pipeline_key
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
}

/// Batched vertex slots sized for `Q`.
pub struct OverlayVertexPools<Q: OverlayQuad> {
    vertices: VertexBufferPool,
    capacity: u32,
    _quad: PhantomData<fn() -> Q>,
}

impl<Q: OverlayQuad> OverlayVertexPools<Q> {
    pub fn new(device: Arc<dyn Device>, config: &OverlayConfig, location: MemoryLocation) -> Result<Self> {
        let capacity = Q::capacity(config);
        let vertices = VertexBufferPool::new(
            device,
            VertexPoolDesc {
                name: Q::NAME.to_owned(),
                element_size: u64::from(capacity) * std::mem::size_of::<Q::Vertex>() as u64,
                batch_size: config.max_overlays_per_buffer,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                location,
            },
        )?;
        Ok(Self {
            vertices,
            capacity,
            _quad: PhantomData,
        })
    }

    /// Vertices one slot holds.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn batch_count(&self) -> usize {
        self.vertices.batch_count()
    }

    pub fn live_count(&self) -> usize {
        self.vertices.live_count()
    }

    /// Reserve a vertex slot and its uniform slot.
    pub fn allocate(&mut self, uniforms: &mut UniformBufferPool, frame: u64) -> Result<OverlaySlot> {
        let vertices = self.vertices.allocate()?;
        let ubo = match uniforms.get_buffer::<OverlayUbo>() {
            Ok(ubo) => ubo,
            Err(err) => {
                self.vertices.deallocate(vertices)?;
                return Err(err);
            }
        };
        Ok(OverlaySlot {
            vertices,
            ubo,
            descriptor_set: None,
            pipeline_key: None,
            views: Vec::new(),
            vertex_count: 0,
            last_frame: frame,
        })
    }

    /// Release both slots. The caller retires the descriptor set.
    pub fn deallocate(&mut self, slot: OverlaySlot, uniforms: &mut UniformBufferPool) -> Result<()> {
        self.vertices.deallocate(slot.vertices)?;
        uniforms.put_buffer(slot.ubo)
    }

    /// Write `vertices` to the slot, truncating to its capacity.
    pub fn write(&mut self, slot: &mut OverlaySlot, vertices: &[Q::Vertex]) -> Result<()> {
        let count = vertices.len().min(self.capacity as usize);
        if count < vertices.len() {
            tracing::warn!(
                pool = Q::NAME,
                vertices = vertices.len(),
                capacity = self.capacity,
                "Overlay vertices truncated to the slot capacity"
            );
        }
        self.vertices
            .write(&slot.vertices, bytemuck::cast_slice(&vertices[..count]))?;
        slot.vertex_count = count as u32;
        Ok(())
    }

    pub fn upload(&mut self, cb: vk::CommandBuffer) -> Result<bool> {
        self.vertices.upload(cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::quad::{PanelQuad, TextQuad};
    use castor3d_gpu::mock::MockDevice;

    fn config(batch: u32) -> OverlayConfig {
        OverlayConfig {
            max_overlays_per_buffer: batch,
            max_chars_per_overlay: 4,
        }
    }

    #[test]
    fn slots_come_with_a_uniform() {
        let device = Arc::new(MockDevice::new());
        let mut uniforms =
            UniformBufferPool::new(device.clone(), "Overlays", 4, MemoryLocation::CpuToGpu);
        let mut panels =
            OverlayVertexPools::<PanelQuad>::new(device, &config(2), MemoryLocation::GpuOnly)
                .unwrap();
        let mut slot = panels.allocate(&mut uniforms, 0).unwrap();
        panels
            .write(&mut slot, &PanelQuad::vertices(glam::Vec2::ONE))
            .unwrap();
        assert_eq!(slot.vertex_count(), 6);
        assert_eq!(uniforms.buffer_count(), 1);
        panels.deallocate(slot, &mut uniforms).unwrap();
        assert_eq!(panels.live_count(), 0);
    }

    #[test]
    fn text_slots_hold_the_configured_glyphs() {
        let device = Arc::new(MockDevice::new());
        let texts =
            OverlayVertexPools::<TextQuad>::new(device, &config(2), MemoryLocation::GpuOnly)
                .unwrap();
        assert_eq!(texts.capacity(), 24);
    }
}
