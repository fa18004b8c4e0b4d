//! Overlay pipelines, one per feature combination.
//!
//! Every pipeline owns its descriptor set layout and a growing list of
//! descriptor pools, so sets of overlays sharing a key come from the same
//! pipeline entry.

use super::data::TextureFlags;
use super::quad::OverlayQuad;
use crate::passes::OwnedPipeline;
use crate::render_device::RenderDevice;
use crate::shaders;
use castor3d_gpu::{
    vk, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWrite,
    GpuError, GraphicsPipelineConfig, Pipeline, Result,
};
use hashbrown::HashMap;
use std::fmt;

/// Sets allocated from one descriptor pool before another is created.
pub const SETS_PER_POOL: u32 = 64;

pub const CAMERA_BINDING: u32 = 0;
pub const OVERLAY_BINDING: u32 = 1;
pub const TEXTURES_BINDING: u32 = 2;
pub const FONT_BINDING: u32 = 3;

const TEXT_BIT: u32 = 0x01;
const COLOUR_BIT: u32 = 0x02;
const OPACITY_BIT: u32 = 0x04;

/// Feature bits in the high byte, texture count in the low byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey(u32);

impl PipelineKey {
    pub fn new(textures: TextureFlags, texture_count: u32, text: bool) -> Self {
        let mut bits = if text { TEXT_BIT } else { 0 };
        if textures.contains(TextureFlags::COLOUR) {
            bits |= COLOUR_BIT;
        }
        if textures.contains(TextureFlags::OPACITY) {
            bits |= OPACITY_BIT;
        }
        Self((bits << 8) | (texture_count & 0xff))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_text(self) -> bool {
        (self.0 >> 8) & TEXT_BIT != 0
    }

    pub const fn texture_count(self) -> u32 {
        self.0 & 0xff
    }

    pub const fn is_textured(self) -> bool {
        self.texture_count() > 0
    }
}

impl fmt::Debug for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineKey({:#06x})", self.0)
    }
}

struct OverlayPipeline {
    pipeline: OwnedPipeline,
    layout: DescriptorSetLayout,
    pools: Vec<DescriptorPool>,
    /// Pool index of every live set.
    owners: HashMap<vk::DescriptorSet, usize>,
}

impl OverlayPipeline {
    fn allocate(&mut self, render: &RenderDevice, writes: &[DescriptorWrite]) -> Result<vk::DescriptorSet> {
        let index = match self.pools.iter().position(DescriptorPool::has_room) {
            Some(index) => index,
            None => {
                self.pools.push(DescriptorPool::new(
                    render.device().clone(),
                    &self.layout,
                    SETS_PER_POOL,
                )?);
                tracing::debug!(pools = self.pools.len(), "Grew overlay descriptor pools");
                self.pools.len() - 1
            }
        };
        let set = self.pools[index].allocate(writes)?;
        self.owners.insert(set, index);
        Ok(set)
    }

    fn free(&mut self, set: vk::DescriptorSet) -> Result<()> {
        let index = self
            .owners
            .remove(&set)
            .ok_or_else(|| GpuError::InvalidHandle(format!("overlay descriptor set {set:?}")))?;
        self.pools[index].free(set)
    }
}

/// Overlay pipelines keyed by [`PipelineKey`].
pub struct PipelineCache {
    render: RenderDevice,
    color_format: vk::Format,
    pipelines: HashMap<PipelineKey, OverlayPipeline>,
}

impl PipelineCache {
    pub fn new(render: RenderDevice, color_format: vk::Format) -> Self {
        Self {
            render,
            color_format,
            pipelines: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn contains(&self, key: PipelineKey) -> bool {
        self.pipelines.contains_key(&key)
    }

    /// The pipeline for `key`, created on first use.
    pub fn get_or_create<Q: OverlayQuad>(&mut self, key: PipelineKey) -> Result<Pipeline> {
        if let Some(entry) = self.pipelines.get(&key) {
            return Ok(entry.pipeline.get());
        }
        let entry = self.create::<Q>(key)?;
        let pipeline = entry.pipeline.get();
        self.pipelines.insert(key, entry);
        Ok(pipeline)
    }

    fn create<Q: OverlayQuad>(&self, key: PipelineKey) -> Result<OverlayPipeline> {
        let device = self.render.device().clone();
        let mut builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(CAMERA_BINDING, vk::ShaderStageFlags::VERTEX)
            .uniform_buffer(
                OVERLAY_BINDING,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            );
        if key.is_textured() {
            builder = builder.sampled_images(
                TEXTURES_BINDING,
                key.texture_count(),
                vk::ShaderStageFlags::FRAGMENT,
            );
        }
        if key.is_text() {
            builder = builder.sampled_images(FONT_BINDING, 1, vk::ShaderStageFlags::FRAGMENT);
        }
        let layout = builder.build(device.clone())?;

        let shaders = self.render.shaders();
        let (vertex_shader, fragment_shader) = if key.is_text() {
            (shaders::OVERLAY_TEXT_VERT, shaders::OVERLAY_TEXT_FRAG)
        } else {
            (shaders::OVERLAY_VERT, shaders::OVERLAY_FRAG)
        };
        let (vertex_bindings, vertex_attributes) = Q::vertex_input(key.is_textured());
        let pipeline = OwnedPipeline::graphics(
            device,
            &GraphicsPipelineConfig {
                vertex_shader: shaders.shader(vertex_shader)?,
                fragment_shader: shaders.shader(fragment_shader)?,
                vertex_bindings,
                vertex_attributes,
                ..GraphicsPipelineConfig::overlay(self.color_format)
            },
            &[layout.handle()],
            &[],
        )?;
        tracing::debug!(key = ?key, kind = Q::NAME, "Created overlay pipeline");

        Ok(OverlayPipeline {
            pipeline,
            layout,
            pools: Vec::new(),
            owners: HashMap::new(),
        })
    }

    /// Allocate a set of the pipeline for `key`, which must exist.
    pub fn allocate_set(&mut self, key: PipelineKey, writes: &[DescriptorWrite]) -> Result<vk::DescriptorSet> {
        let render = &self.render;
        self.pipelines
            .get_mut(&key)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("overlay pipeline {key:?}")))?
            .allocate(render, writes)
    }

    /// Give a set back to its pool. Only once no submission uses it.
    pub fn free_set(&mut self, key: PipelineKey, set: vk::DescriptorSet) -> Result<()> {
        self.pipelines
            .get_mut(&key)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("overlay pipeline {key:?}")))?
            .free(set)
    }

    /// Descriptor pools created for `key`.
    pub fn pool_count(&self, key: PipelineKey) -> usize {
        self.pipelines.get(&key).map_or(0, |entry| entry.pools.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let key = PipelineKey::new(TextureFlags::COLOUR, 1, false);
        assert_eq!(key.bits(), (COLOUR_BIT << 8) | 1);
        assert!(!key.is_text());
        assert!(key.is_textured());

        let text = PipelineKey::new(TextureFlags::COLOUR | TextureFlags::OPACITY, 2, true);
        assert_eq!(text.bits(), 0x0702);
        assert!(text.is_text());
        assert_eq!(text.texture_count(), 2);

        assert_ne!(
            PipelineKey::new(TextureFlags::empty(), 0, false),
            PipelineKey::new(TextureFlags::empty(), 0, true)
        );
    }
}
