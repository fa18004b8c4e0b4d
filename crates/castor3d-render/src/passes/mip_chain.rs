//! Mip chain generation by successive blits.

use super::PassStep;
use crate::graph::{RecordContext, RunnablePass};
use castor3d_gpu::{vk, Result};

/// Fills mips `1..mip_levels` of an image from its base level.
///
/// The base level is expected in `initial_layout`; every level ends in
/// `final_layout`.
#[derive(Debug, Clone, Copy)]
pub struct MipChainPass {
    pub image: vk::Image,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

const fn mip_range(base_mip_level: u32, level_count: u32, layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count,
    }
}

fn mip_offset(extent: vk::Extent3D, level: u32) -> vk::Offset3D {
    let size = |value: u32| ((value >> level).max(1)) as i32;
    vk::Offset3D {
        x: size(extent.width),
        y: size(extent.height),
        z: size(extent.depth),
    }
}

impl MipChainPass {
    fn layers(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// The commands this pass records, in order.
    pub fn steps(&self) -> Vec<MipStep> {
        let mut steps = Vec::new();
        let layers = self.array_layers;
        if self.mip_levels <= 1 {
            if self.initial_layout != self.final_layout {
                steps.push(MipStep::Barrier(PassStep::transition(
                    self.image,
                    mip_range(0, 1, layers),
                    self.initial_layout,
                    self.final_layout,
                )));
            }
            return steps;
        }

        for level in 1..self.mip_levels {
            let source_layout = if level == 1 {
                self.initial_layout
            } else {
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            };
            steps.push(MipStep::Barrier(PassStep::transition(
                self.image,
                mip_range(level - 1, 1, layers),
                source_layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )));
            steps.push(MipStep::Barrier(PassStep::transition(
                self.image,
                mip_range(level, 1, layers),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )));
            steps.push(MipStep::Blit(vk::ImageBlit {
                src_subresource: self.layers(level - 1),
                src_offsets: [vk::Offset3D::default(), mip_offset(self.extent, level - 1)],
                dst_subresource: self.layers(level),
                dst_offsets: [vk::Offset3D::default(), mip_offset(self.extent, level)],
            }));
        }

        let last = self.mip_levels - 1;
        steps.push(MipStep::Barrier(PassStep::transition(
            self.image,
            mip_range(0, last, layers),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.final_layout,
        )));
        steps.push(MipStep::Barrier(PassStep::transition(
            self.image,
            mip_range(last, 1, layers),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            self.final_layout,
        )));
        steps
    }
}

/// One command of a mip chain.
#[derive(Debug, Clone, Copy)]
pub enum MipStep {
    Barrier(PassStep),
    Blit(vk::ImageBlit),
}

impl RunnablePass for MipChainPass {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()> {
        for step in self.steps() {
            match step {
                MipStep::Barrier(barrier) => barrier.record(ctx.device, ctx.command_buffer),
                MipStep::Blit(region) => ctx.device.cmd_blit_image(
                    ctx.command_buffer,
                    self.image,
                    self.image,
                    &region,
                    vk::Filter::LINEAR,
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(mip_levels: u32) -> MipChainPass {
        MipChainPass {
            image: vk::Image::null(),
            extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 64,
            },
            mip_levels,
            array_layers: 1,
            initial_layout: vk::ImageLayout::GENERAL,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    #[test]
    fn one_blit_per_extra_level() {
        let steps = chain(7).steps();
        let blits: Vec<_> = steps
            .iter()
            .filter_map(|step| match step {
                MipStep::Blit(region) => Some(*region),
                MipStep::Barrier(_) => None,
            })
            .collect();
        assert_eq!(blits.len(), 6);
        assert_eq!(blits[0].dst_offsets[1].x, 32);
        assert_eq!(blits[5].dst_offsets[1].z, 1);
        assert_eq!(blits[5].src_subresource.mip_level, 5);
    }

    #[test]
    fn single_level_only_transitions() {
        let steps = chain(1).steps();
        assert_eq!(steps.len(), 1);
        assert!(matches!(steps[0], MipStep::Barrier(_)));
    }
}
