//! Overlay preparation, submission and slot lifetime against the mock device.

mod common;

use castor3d_gpu::mock::{MockCommand, MockDevice};
use castor3d_gpu::vk::{self, Handle};
use castor3d_gpu::{
    execute_single_time_commands, DescriptorWrite, Device, GpuError, GpuImage, QueueKind,
    SemaphoreWait,
};
use castor3d_render::overlay::pipeline::FONT_BINDING;
use castor3d_render::overlay::{
    BorderPosition, BorderSize, FontTexture, Glyph, MaterialPass, Overlay, OverlayId,
    OverlayRenderer, PassId, PassTexture, PrepareSummary, TextureFlags,
};
use castor3d_render::RenderDevice;
use glam::Vec2;
use std::sync::Arc;

fn overlay_renderer(
    device: &Arc<MockDevice>,
    render: &RenderDevice,
) -> (GpuImage, OverlayRenderer) {
    let (image, target) = common::overlay_target(device, 800, 600);
    let renderer = OverlayRenderer::new(render, target, QueueKind::Graphics).unwrap();
    (image, renderer)
}

fn panel(id: u64) -> Overlay {
    Overlay::panel(
        id,
        Vec2::new(0.1, 0.1),
        Vec2::new(0.2, 0.1),
        vec![MaterialPass::new(1, [1.0, 0.0, 0.0, 1.0])],
    )
}

fn textured(id: u64, view: u64) -> Overlay {
    Overlay::panel(
        id,
        Vec2::ZERO,
        Vec2::new(0.5, 0.5),
        vec![MaterialPass::new(1, [1.0; 4]).with_texture(PassTexture {
            flags: TextureFlags::COLOUR,
            view: vk::ImageView::from_raw(view),
            sampler: vk::Sampler::null(),
        })],
    )
}

fn text(id: u64, glyphs: usize) -> Overlay {
    let glyphs = (0..glyphs)
        .map(|index| Glyph {
            position: Vec2::new(index as f32 * 8.0, 0.0),
            size: Vec2::new(8.0, 12.0),
            atlas: [0.0, 0.0, 0.1, 0.1],
        })
        .collect();
    Overlay::text(
        id,
        Vec2::new(0.0, 0.9),
        Vec2::new(0.5, 0.05),
        vec![MaterialPass::new(1, [1.0; 4])],
        FontTexture {
            view: vk::ImageView::from_raw(0xf0),
            sampler: vk::Sampler::null(),
        },
        glyphs,
    )
}

/// Prepare, upload and submit one frame, then consume its output.
fn run_frame(
    device: &MockDevice,
    renderer: &mut OverlayRenderer,
    frame: u64,
    overlays: &[Overlay],
) -> PrepareSummary {
    let mut preparer = renderer.begin_prepare(frame).unwrap();
    for overlay in overlays {
        preparer.visit(overlay).unwrap();
    }
    let summary = preparer.end_prepare().unwrap();
    execute_single_time_commands(device, QueueKind::Transfer, |cb| {
        renderer.upload(cb).map(|_| ())
    })
    .unwrap();
    let waits = renderer.render(&[]).unwrap();
    device.consume_waits(&waits).unwrap();
    summary
}

fn draw_counts(device: &MockDevice, cb: vk::CommandBuffer) -> Vec<u32> {
    device
        .recorded_commands(cb)
        .into_iter()
        .filter_map(|command| match command {
            MockCommand::Draw { vertex_count, .. } => Some(vertex_count),
            _ => None,
        })
        .collect()
}

fn scissors(device: &MockDevice, cb: vk::CommandBuffer) -> Vec<vk::Rect2D> {
    device
        .recorded_commands(cb)
        .into_iter()
        .filter_map(|command| match command {
            MockCommand::SetScissor(rect) => Some(rect),
            _ => None,
        })
        .collect()
}

#[test]
fn freed_panel_slot_is_reused_before_growing() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    run_frame(&device, &mut renderer, 0, &[panel(1), panel(2), panel(3)]);
    assert_eq!(renderer.panel_pools().batch_count(), 2);
    let third = renderer.panel_slot(OverlayId(3), PassId(1)).unwrap();
    assert_eq!(third.vertices().batch(), 1);
    assert_eq!(third.vertices().slot(), 0);

    // Overlay 2 held slot 1 of the first batch.
    let summary = run_frame(&device, &mut renderer, 1, &[panel(1), panel(3)]);
    assert_eq!(summary.reclaimed, 1);
    assert_eq!(renderer.panel_pools().live_count(), 2);

    run_frame(&device, &mut renderer, 2, &[panel(1), panel(3), panel(4)]);
    let fourth = renderer.panel_slot(OverlayId(4), PassId(1)).unwrap();
    assert_eq!(fourth.vertices().batch(), 0);
    assert_eq!(fourth.vertices().slot(), 1);
    assert_eq!(renderer.panel_pools().batch_count(), 2);
    assert!(device.violations().is_empty());
}

#[test]
fn prepared_frame_is_bracketed_and_submitted() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (image, mut renderer) = overlay_renderer(&device, &render);
    let upstream = device.create_semaphore("Scene").unwrap();
    device.signal_semaphore(upstream).unwrap();

    let mut preparer = renderer.begin_prepare(0).unwrap();
    preparer.visit(&panel(1)).unwrap();
    preparer.visit(&text(2, 3)).unwrap();
    let summary = preparer.end_prepare().unwrap();
    assert_eq!(summary.draws, 2);

    let cb = renderer.command_buffer();
    let commands = device.recorded_commands(cb);
    assert!(matches!(
        commands.first(),
        Some(MockCommand::ImageBarrier(barrier))
            if barrier.image == image.image()
                && barrier.new_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    ));
    assert!(matches!(
        &commands[1],
        MockCommand::BeginRendering { color, .. } if color[0].clear == Some([0.0; 4])
    ));
    assert!(matches!(
        commands.last(),
        Some(MockCommand::ImageBarrier(barrier))
            if barrier.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    ));
    assert_eq!(draw_counts(&device, cb), vec![6, 18]);

    let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    let waits = renderer.render(&[wait]).unwrap();
    assert_eq!(
        waits,
        vec![SemaphoreWait::new(
            renderer.semaphore(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        )]
    );
    let submissions = device.submissions();
    let last = submissions.last().unwrap();
    assert_eq!(last.command_buffers, vec![cb]);
    assert_eq!(last.waits, vec![wait]);
    assert!(last.fence.is_some());
    assert!(device.violations().is_empty());
}

#[test]
fn pipelines_are_shared_by_feature_key() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    let overlays = [panel(1), panel(2), panel(3), textured(4, 0x10)];
    run_frame(&device, &mut renderer, 0, &overlays);
    assert_eq!(renderer.pipelines().len(), 2);
    let created = device.pipeline_creation_count();

    run_frame(&device, &mut renderer, 1, &overlays);
    assert_eq!(device.pipeline_creation_count(), created);
}

#[test]
fn overlays_not_visited_are_reclaimed_and_their_sets_retired() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    run_frame(&device, &mut renderer, 0, &[panel(1), panel(2)]);
    let live_sets = device.live_descriptor_set_count();

    let summary = run_frame(&device, &mut renderer, 1, &[panel(1)]);
    assert_eq!(summary.reclaimed, 1);
    assert_eq!(renderer.slot_count(), 1);
    assert_eq!(renderer.retired_count(), 1);
    // Still bound by frames that may be in flight.
    assert_eq!(device.live_descriptor_set_count(), live_sets);

    // Released once the submission of the frame that retired it completed.
    run_frame(&device, &mut renderer, 2, &[panel(1)]);
    assert_eq!(renderer.retired_count(), 0);
    assert_eq!(device.live_descriptor_set_count(), live_sets - 1);
}

#[test]
fn slots_of_distinct_overlay_and_pass_pairs_never_alias() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    let first = Overlay::panel(
        0,
        Vec2::new(0.1, 0.1),
        Vec2::new(0.2, 0.1),
        vec![MaterialPass::new(63, [1.0, 0.0, 0.0, 1.0])],
    );
    let second = Overlay::panel(
        1,
        Vec2::new(0.5, 0.5),
        Vec2::new(0.2, 0.1),
        vec![MaterialPass::new(0, [0.0, 1.0, 0.0, 1.0])],
    );
    let summary = run_frame(&device, &mut renderer, 0, &[first, second]);
    assert_eq!(summary.draws, 2);
    assert_eq!(renderer.slot_count(), 2);

    let a = renderer.panel_slot(OverlayId(0), PassId(63)).unwrap();
    let b = renderer.panel_slot(OverlayId(1), PassId(0)).unwrap();
    assert_ne!(
        (a.vertices().batch(), a.vertices().slot()),
        (b.vertices().batch(), b.vertices().slot())
    );
    assert!(renderer.panel_slot(OverlayId(0), PassId(0)).is_none());
    assert!(device.violations().is_empty());
}

#[test]
fn texture_change_replaces_the_descriptor_set() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    run_frame(&device, &mut renderer, 0, &[textured(1, 0x10)]);
    let first = renderer
        .panel_slot(OverlayId(1), PassId(1))
        .and_then(|slot| slot.descriptor_set())
        .unwrap();

    run_frame(&device, &mut renderer, 1, &[textured(1, 0x10)]);
    assert_eq!(renderer.retired_count(), 0);

    run_frame(&device, &mut renderer, 2, &[textured(1, 0x20)]);
    let second = renderer
        .panel_slot(OverlayId(1), PassId(1))
        .and_then(|slot| slot.descriptor_set())
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(renderer.retired_count(), 1);
    assert_eq!(renderer.slot_count(), 1);
}

#[test]
fn text_binds_the_font_and_truncates_glyphs() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    run_frame(&device, &mut renderer, 0, &[text(7, 10)]);
    assert_eq!(draw_counts(&device, renderer.command_buffer()), vec![48]);

    let slot = renderer.text_slot(OverlayId(7), PassId(1)).unwrap();
    assert_eq!(slot.vertex_count(), 48);
    let writes = device.descriptor_writes(slot.descriptor_set().unwrap());
    assert!(writes.iter().any(|write| matches!(
        write,
        DescriptorWrite::SampledImage { binding, view, .. }
            if *binding == FONT_BINDING && *view == vk::ImageView::from_raw(0xf0)
    )));
    assert!(slot.pipeline_key().unwrap().is_text());
}

#[test]
fn border_panels_fill_both_pools() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);
    let overlay = Overlay::border_panel(
        5,
        Vec2::new(0.25, 0.25),
        Vec2::new(0.5, 0.5),
        vec![MaterialPass::new(1, [0.2; 4])],
        BorderSize::uniform(4),
        BorderPosition::External,
        vec![MaterialPass::new(2, [1.0; 4])],
    );

    let summary = run_frame(&device, &mut renderer, 0, &[overlay]);
    assert_eq!(summary.draws, 2);
    assert_eq!(renderer.panel_pools().live_count(), 1);
    assert_eq!(renderer.border_pools().live_count(), 1);
    assert!(renderer.border_slot(OverlayId(5), PassId(2)).is_some());

    let cb = renderer.command_buffer();
    assert_eq!(draw_counts(&device, cb), vec![6, 48]);
    let rects = scissors(&device, cb);
    assert_eq!(rects[0].offset, vk::Offset2D { x: 200, y: 150 });
    assert_eq!(rects[1].offset, vk::Offset2D { x: 196, y: 146 });
    assert_eq!(
        rects[1].extent,
        vk::Extent2D {
            width: 408,
            height: 308
        }
    );
}

#[test]
fn hidden_overlays_and_implicit_passes_are_not_drawn() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    let mut hidden = panel(1);
    hidden.visible = false;
    let mut implicit = panel(2);
    implicit.material.push(MaterialPass {
        implicit: true,
        ..MaterialPass::new(9, [1.0; 4])
    });

    let summary = run_frame(&device, &mut renderer, 0, &[hidden, implicit]);
    assert_eq!(summary.draws, 1);
    assert_eq!(renderer.slot_count(), 1);
    assert!(renderer.panel_slot(OverlayId(2), PassId(9)).is_none());
}

#[test]
fn submission_requires_a_finished_preparation() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    assert!(matches!(renderer.render(&[]), Err(GpuError::InvalidState(_))));

    let preparer = renderer.begin_prepare(0).unwrap();
    preparer.end_prepare().unwrap();
    assert!(matches!(
        renderer.begin_prepare(1),
        Err(GpuError::InvalidState(_))
    ));
    let waits = renderer.render(&[]).unwrap();
    device.consume_waits(&waits).unwrap();
    assert!(renderer.begin_prepare(1).is_ok());
}

#[test]
fn abandoned_preparation_submits_nothing() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);

    let mut preparer = renderer.begin_prepare(0).unwrap();
    preparer.visit(&panel(1)).unwrap();
    drop(preparer);
    assert!(renderer.render(&[]).is_err());

    run_frame(&device, &mut renderer, 1, &[panel(1)]);
    assert!(device.violations().is_empty());
}

#[test]
fn resize_is_reported_until_the_next_preparation() {
    let (device, render) = common::render_device(common::small_overlay_config());
    let (_image, mut renderer) = overlay_renderer(&device, &render);
    run_frame(&device, &mut renderer, 0, &[]);
    assert!(!renderer.size_changed());

    let (_larger, target) = common::overlay_target(&device, 1024, 768);
    renderer.resize(target).unwrap();
    assert!(renderer.size_changed());
    run_frame(&device, &mut renderer, 1, &[panel(1)]);
    assert!(!renderer.size_changed());
    let rects = scissors(&device, renderer.command_buffer());
    assert_eq!(rects[0].offset, vk::Offset2D { x: 102, y: 76 });
}
