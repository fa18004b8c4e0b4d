//! Per-frame recording of overlay draws.

use super::data::{extent_vec, BorderSize, FontTexture, MaterialPass, Overlay, OverlayKind};
use super::pipeline::{
    PipelineCache, PipelineKey, CAMERA_BINDING, FONT_BINDING, OVERLAY_BINDING, TEXTURES_BINDING,
};
use super::pool::{OverlaySlot, OverlayUbo, OverlayVertexPools};
use super::quad::{BorderQuad, OverlayQuad, PanelQuad, TextQuad};
use super::renderer::{OverlayRenderer, RetiredSet, SlotKey};
use crate::passes::PassStep;
use castor3d_gpu::{color_range, vk, DescriptorWrite, Result, RetirementQueue, UniformBufferPool};
use glam::Vec2;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

/// The renderer state one overlay shape works on, borrowed disjointly.
pub(crate) struct ShapeParts<'a, Q: OverlayQuad> {
    pools: &'a mut OverlayVertexPools<Q>,
    slots: &'a mut HashMap<SlotKey, OverlaySlot>,
    uniforms: &'a mut UniformBufferPool,
    pipelines: &'a mut PipelineCache,
    retired: &'a mut RetirementQueue<RetiredSet>,
}

/// Shapes with their own pools and slot map in the renderer.
pub(crate) trait ShapeStorage: OverlayQuad + Sized {
    fn parts(renderer: &mut OverlayRenderer) -> ShapeParts<'_, Self>;
}

macro_rules! shape_storage {
    ($quad:ty, $pools:ident, $slots:ident) => {
        impl ShapeStorage for $quad {
            fn parts(renderer: &mut OverlayRenderer) -> ShapeParts<'_, Self> {
                ShapeParts {
                    pools: &mut renderer.$pools,
                    slots: &mut renderer.$slots,
                    uniforms: &mut renderer.uniforms,
                    pipelines: &mut renderer.pipelines,
                    retired: &mut renderer.retired,
                }
            }
        }
    };
}

shape_storage!(PanelQuad, panels, panel_slots);
shape_storage!(BorderQuad, borders, border_slots);
shape_storage!(TextQuad, texts, text_slots);

/// What one draw of one material pass needs.
struct SlotRequest<'a, V> {
    key: SlotKey,
    pass: &'a MaterialPass,
    position: Vec2,
    size: Vec2,
    vertices: &'a [V],
    font: Option<&'a FontTexture>,
    /// Part of a border drawn beyond the panel, widening the scissor.
    outside: BorderSize,
}

/// Counters of a finished preparation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareSummary {
    pub draws: u32,
    /// Slots of overlays not visited this frame, given back to the pools.
    pub reclaimed: usize,
}

/// Records the draws of one frame. Obtained from
/// [`OverlayRenderer::begin_prepare`], closed by [`Preparer::end_prepare`].
///
/// Dropping it without `end_prepare` closes the command buffer and leaves
/// nothing to submit.
pub struct Preparer<'a> {
    renderer: &'a mut OverlayRenderer,
    frame: u64,
    draws: u32,
    finished: bool,
}

impl<'a> Preparer<'a> {
    pub(crate) fn new(renderer: &'a mut OverlayRenderer, frame: u64) -> Self {
        Self {
            renderer,
            frame,
            draws: 0,
            finished: false,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Draws recorded so far.
    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    /// Record the draws of `overlay`, one per explicit material pass.
    pub fn visit(&mut self, overlay: &Overlay) -> Result<()> {
        if !overlay.visible {
            return Ok(());
        }
        let extent = self.renderer.target.extent;
        let position = overlay.absolute_position(extent);
        let size = overlay.absolute_size(extent);

        match &overlay.kind {
            OverlayKind::Panel => self.panel(overlay, position, size),
            OverlayKind::BorderPanel {
                border,
                border_position,
                border_material,
            } => {
                self.panel(overlay, position, size)?;
                let outside = border.outside(*border_position);
                let vertices = BorderQuad::vertices(size, *border, outside);
                for pass in border_material.iter().filter(|pass| !pass.implicit) {
                    self.prepare_slot::<BorderQuad>(&SlotRequest {
                        key: (overlay.id, pass.id),
                        pass,
                        position,
                        size,
                        vertices: &vertices,
                        font: None,
                        outside,
                    })?;
                }
                Ok(())
            }
            OverlayKind::Text { font, glyphs } => {
                let max_chars = self.renderer.config.max_chars_per_overlay;
                let vertices = TextQuad::vertices(size, glyphs, max_chars);
                for pass in overlay.material.iter().filter(|pass| !pass.implicit) {
                    self.prepare_slot::<TextQuad>(&SlotRequest {
                        key: (overlay.id, pass.id),
                        pass,
                        position,
                        size,
                        vertices: &vertices,
                        font: Some(font),
                        outside: BorderSize::default(),
                    })?;
                }
                Ok(())
            }
        }
    }

    fn panel(&mut self, overlay: &Overlay, position: Vec2, size: Vec2) -> Result<()> {
        let vertices = PanelQuad::vertices(size);
        for pass in overlay.material.iter().filter(|pass| !pass.implicit) {
            self.prepare_slot::<PanelQuad>(&SlotRequest {
                key: (overlay.id, pass.id),
                pass,
                position,
                size,
                vertices: &vertices,
                font: None,
                outside: BorderSize::default(),
            })?;
        }
        Ok(())
    }

    fn prepare_slot<Q: ShapeStorage>(&mut self, request: &SlotRequest<'_, Q::Vertex>) -> Result<()> {
        let frame = self.frame;
        let renderer = &mut *self.renderer;
        let device = renderer.render.device().clone();
        let extent = renderer.target.extent;
        let camera = renderer.camera.descriptor_write(CAMERA_BINDING);
        let cb = renderer.commands.command_buffer();
        let parts = Q::parts(renderer);

        let slot = match parts.slots.entry(request.key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(parts.pools.allocate(parts.uniforms, frame)?),
        };
        slot.last_frame = frame;

        let pass = request.pass;
        parts.uniforms.write(
            &slot.ubo,
            &OverlayUbo {
                position_size: [
                    request.position.x,
                    request.position.y,
                    request.size.x,
                    request.size.y,
                ],
                colour: pass.colour,
                render_size_pass: [
                    extent.width,
                    extent.height,
                    pass.id.0 as u32,
                    pass.opacity.to_bits(),
                ],
            },
        )?;
        parts.pools.write(slot, request.vertices)?;
        if slot.vertex_count == 0 {
            return Ok(());
        }

        let key = PipelineKey::new(pass.texture_flags(), pass.texture_count(), Q::TEXT);
        let pipeline = parts.pipelines.get_or_create::<Q>(key)?;

        let mut views: Vec<vk::ImageView> =
            pass.textures.iter().map(|texture| texture.view).collect();
        views.extend(request.font.map(|font| font.view));
        if let (Some(set), Some(old_key)) = (slot.descriptor_set, slot.pipeline_key) {
            if old_key != key || slot.views != views {
                parts.retired.retire((old_key, set), frame);
                slot.descriptor_set = None;
            }
        }
        let set = match slot.descriptor_set {
            Some(set) => set,
            None => {
                let mut writes = vec![camera, slot.ubo.descriptor_write(OVERLAY_BINDING)];
                writes.extend(pass.textures.iter().enumerate().map(|(index, texture)| {
                    DescriptorWrite::SampledImage {
                        binding: TEXTURES_BINDING,
                        array_element: index as u32,
                        view: texture.view,
                        sampler: texture.sampler,
                    }
                }));
                if let Some(font) = request.font {
                    writes.push(DescriptorWrite::SampledImage {
                        binding: FONT_BINDING,
                        array_element: 0,
                        view: font.view,
                        sampler: font.sampler,
                    });
                }
                let set = parts.pipelines.allocate_set(key, &writes)?;
                slot.descriptor_set = Some(set);
                slot.pipeline_key = Some(key);
                slot.views = views;
                set
            }
        };

        device.cmd_bind_pipeline(cb, &pipeline);
        device.cmd_set_viewport(
            cb,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        device.cmd_set_scissor(
            cb,
            scissor(request.position, request.size, request.outside, extent),
        );
        device.cmd_bind_descriptor_set(cb, &pipeline, 0, set);
        device.cmd_bind_vertex_buffer(cb, 0, slot.vertices.buffer(), slot.vertices.offset());
        device.cmd_draw(cb, slot.vertex_count, 1);
        self.draws += 1;
        Ok(())
    }

    /// Close the rendering scope and the command buffer, then reclaim the
    /// slots of overlays that were not visited this frame.
    pub fn end_prepare(mut self) -> Result<PrepareSummary> {
        self.finished = true;
        let frame = self.frame;
        let draws = self.draws;
        let renderer = &mut *self.renderer;
        let device = renderer.render.device().clone();
        let cb = renderer.commands.command_buffer();

        device.cmd_end_rendering(cb);
        PassStep::transition(
            renderer.target.image,
            color_range(1, 1),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .record(device.as_ref(), cb);
        renderer.commands.end()?;
        renderer.awaiting_submit = true;
        renderer.size_changed = false;

        let reclaimed = reclaim::<PanelQuad>(renderer, frame)?
            + reclaim::<BorderQuad>(renderer, frame)?
            + reclaim::<TextQuad>(renderer, frame)?;
        if reclaimed > 0 {
            tracing::debug!(reclaimed, frame, "Reclaimed overlay slots");
        }
        Ok(PrepareSummary { draws, reclaimed })
    }
}

impl Drop for Preparer<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let device = self.renderer.render.device().clone();
        device.cmd_end_rendering(self.renderer.commands.command_buffer());
        if let Err(err) = self.renderer.commands.end() {
            tracing::error!(%err, "Failed closing abandoned overlay commands");
        }
        tracing::warn!(frame = self.frame, "Overlay preparation abandoned");
    }
}

fn reclaim<Q: ShapeStorage>(renderer: &mut OverlayRenderer, frame: u64) -> Result<usize> {
    let parts = Q::parts(renderer);
    let stale: Vec<SlotKey> = parts
        .slots
        .iter()
        .filter(|(_, slot)| slot.last_frame != frame)
        .map(|(key, _)| *key)
        .collect();
    for key in &stale {
        if let Some(slot) = parts.slots.remove(key) {
            if let (Some(pipeline), Some(set)) = (slot.pipeline_key, slot.descriptor_set) {
                parts.retired.retire((pipeline, set), frame);
            }
            parts.pools.deallocate(slot, parts.uniforms)?;
        }
    }
    Ok(stale.len())
}

/// Scissor of an overlay, widened by the border drawn outside it and
/// clamped to the target.
fn scissor(position: Vec2, size: Vec2, outside: BorderSize, target: vk::Extent2D) -> vk::Rect2D {
    let min = (position - Vec2::new(outside.left as f32, outside.top as f32)).max(Vec2::ZERO);
    let max = (position + size + Vec2::new(outside.right as f32, outside.bottom as f32))
        .min(extent_vec(target));
    let extent = (max - min).max(Vec2::ONE);
    vk::Rect2D {
        offset: vk::Offset2D {
            x: min.x as i32,
            y: min.y as i32,
        },
        extent: vk::Extent2D {
            width: extent.x as u32,
            height: extent.y as u32,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn scissor_covers_the_outer_border() {
        let rect = scissor(
            Vec2::new(100.0, 50.0),
            Vec2::new(200.0, 100.0),
            BorderSize::uniform(4),
            TARGET,
        );
        assert_eq!(rect.offset, vk::Offset2D { x: 96, y: 46 });
        assert_eq!(
            rect.extent,
            vk::Extent2D {
                width: 208,
                height: 108
            }
        );
    }

    #[test]
    fn scissor_is_clamped_to_the_target() {
        let rect = scissor(
            Vec2::new(-20.0, 590.0),
            Vec2::new(50.0, 50.0),
            BorderSize::default(),
            TARGET,
        );
        assert_eq!(rect.offset, vk::Offset2D { x: 0, y: 590 });
        assert_eq!(
            rect.extent,
            vk::Extent2D {
                width: 30,
                height: 10
            }
        );
    }

    #[test]
    fn offscreen_overlays_keep_a_valid_scissor() {
        let rect = scissor(
            Vec2::new(900.0, 700.0),
            Vec2::new(10.0, 10.0),
            BorderSize::default(),
            TARGET,
        );
        assert_eq!(rect.extent.width, 1);
        assert_eq!(rect.extent.height, 1);
    }
}
