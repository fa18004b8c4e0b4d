//! Shared setup for the render integration tests.

#![allow(dead_code)]

use castor3d_core::{EngineConfig, OverlayConfig};
use castor3d_gpu::mock::MockDevice;
use castor3d_gpu::{vk, GpuImage, ImageDesc};
use castor3d_render::overlay::OverlayTarget;
use castor3d_render::{InMemoryShaderLibrary, RenderDevice, StaticGeometry};
use std::sync::Arc;

pub fn render_device(config: EngineConfig) -> (Arc<MockDevice>, RenderDevice) {
    let device = Arc::new(MockDevice::new());
    let render = RenderDevice::new(
        device.clone(),
        config,
        Arc::new(InMemoryShaderLibrary::placeholder()),
    )
    .unwrap();
    (device, render)
}

/// Overlay batches of two slots and at most eight glyphs per text.
pub fn small_overlay_config() -> EngineConfig {
    EngineConfig {
        overlays: OverlayConfig {
            max_overlays_per_buffer: 2,
            max_chars_per_overlay: 8,
        },
        ..EngineConfig::default()
    }
}

pub fn overlay_target(
    device: &Arc<MockDevice>,
    width: u32,
    height: u32,
) -> (GpuImage, OverlayTarget) {
    let image = GpuImage::new(
        device.clone(),
        &ImageDesc::new_2d("OverlayTarget", vk::Format::R8G8B8A8_UNORM, width, height),
        vk::ImageViewType::TYPE_2D,
    )
    .unwrap();
    let target = OverlayTarget::from_image(&image);
    (image, target)
}

pub fn geometry() -> Arc<StaticGeometry> {
    Arc::new(StaticGeometry {
        meshes: vec![(vk::Buffer::null(), 0, 36)],
    })
}
