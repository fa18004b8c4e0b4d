//! Semaphore chaining of the pass-chain components against the mock device.

mod common;

use castor3d_core::config::{ShadowConfig, VoxelConfig};
use castor3d_core::EngineConfig;
use castor3d_gpu::mock::{MockDevice, MockSubmission};
use castor3d_gpu::{vk, Device, QueueKind, SemaphoreWait};
use castor3d_render::{
    Camera, CountingProgress, CpuUpdater, EnvironmentMap, FrameComponent, GpuUpdater, LightData,
    LightKind, RenderTechnique, SceneNodeId, ShadowMap, StaticScene, Voxelizer,
};
use glam::Vec3;

fn voxel_config(secondary_bounce: bool) -> EngineConfig {
    EngineConfig {
        voxels: VoxelConfig {
            enabled: true,
            enable_secondary_bounce: secondary_bounce,
            grid_size: 16,
            ..VoxelConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn small_shadows() -> ShadowConfig {
    ShadowConfig {
        directional_cascades: 2,
        max_directional_lights: 1,
        max_point_lights: 0,
        max_spot_lights: 2,
        map_size: 64,
        ..ShadowConfig::default()
    }
}

fn scene() -> StaticScene {
    StaticScene {
        nodes: vec![(SceneNodeId(1), Vec3::new(0.0, 2.0, 0.0))],
        bounds: castor3d_core::Aabb::new(Vec3::splat(-10.0), Vec3::splat(10.0)),
        lights: vec![
            LightData::directional(1, Vec3::new(-1.0, -1.0, 0.0)),
            LightData::spot(2, Vec3::new(0.0, 5.0, 40.0), Vec3::NEG_Y, 50.0, 0.8),
            LightData::spot(3, Vec3::new(0.0, 5.0, 2.0), Vec3::NEG_Y, 50.0, 0.8),
            LightData::spot(4, Vec3::new(0.0, 5.0, -10.0), Vec3::NEG_Y, 50.0, 0.8),
        ],
    }
}

fn update(component: &mut dyn FrameComponent, frame: u64, scene: &StaticScene) {
    let camera = Camera::default();
    component
        .update_cpu(&CpuUpdater {
            frame,
            camera: &camera,
            scene,
        })
        .unwrap();
    component
        .update_gpu(&GpuUpdater {
            frame,
            upload: None,
        })
        .unwrap();
}

/// Graph name of the work a submission signals, e.g. `Voxelizer`.
fn graph_of(device: &MockDevice, submission: &MockSubmission) -> String {
    submission
        .signals
        .first()
        .and_then(|&semaphore| device.semaphore_name(semaphore))
        .and_then(|name| name.split('/').next().map(str::to_owned))
        .unwrap_or_default()
}

/// Every submission after the first waits on something the previous one signalled.
fn assert_chained(submissions: &[MockSubmission]) {
    for pair in submissions.windows(2) {
        assert!(
            pair[1]
                .waits
                .iter()
                .any(|wait| pair[0].signals.contains(&wait.semaphore)),
            "{:?} does not wait on {:?}",
            pair[1].signals,
            pair[0].signals
        );
    }
}

#[test]
fn voxelizer_stages_wait_on_their_predecessor() {
    let (device, render) = common::render_device(voxel_config(true));
    let mut voxelizer = Voxelizer::new(&render, common::geometry(), None).unwrap();
    let scene = scene();
    update(&mut voxelizer, 0, &scene);

    let waits = voxelizer.render(&[], QueueKind::Graphics).unwrap();
    let submissions = device.submissions();
    assert_eq!(submissions.len(), 5);
    assert!(submissions[0].waits.is_empty());
    assert_chained(&submissions);

    let last = submissions.last().unwrap();
    assert_eq!(waits.len(), 1);
    assert!(last.signals.contains(&waits[0].semaphore));
    assert_eq!(waits[0].stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    device.consume_waits(&waits).unwrap();
    assert!(device.violations().is_empty());
}

#[test]
fn disabled_bounce_passes_the_first_bounce_wait_through() {
    let (device, render) = common::render_device(voxel_config(false));
    let mut voxelizer = Voxelizer::new(&render, common::geometry(), None).unwrap();
    let scene = scene();
    update(&mut voxelizer, 0, &scene);

    let waits = voxelizer.render(&[], QueueKind::Graphics).unwrap();
    let submissions = device.submissions();
    assert_eq!(submissions.len(), 3);
    let first_bounce_mips = &submissions[2];
    assert_eq!(
        waits,
        vec![SemaphoreWait::new(
            first_bounce_mips.signals[0],
            vk::PipelineStageFlags::FRAGMENT_SHADER
        )]
    );
    device.consume_waits(&waits).unwrap();

    voxelizer.set_secondary_bounce(true);
    update(&mut voxelizer, 1, &scene);
    let waits = voxelizer.render(&[], QueueKind::Graphics).unwrap();
    assert_eq!(device.submission_count(), 3 + 5);
    device.consume_waits(&waits).unwrap();
    assert!(device.violations().is_empty());
}

#[test]
fn external_wait_reaches_the_first_stage() {
    let (device, render) = common::render_device(voxel_config(false));
    let mut voxelizer = Voxelizer::new(&render, common::geometry(), None).unwrap();
    let scene = scene();
    update(&mut voxelizer, 0, &scene);

    let upstream = device.create_semaphore("Upstream").unwrap();
    device.signal_semaphore(upstream).unwrap();
    let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::TRANSFER);
    let waits = voxelizer.render(&[wait], QueueKind::Graphics).unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions[0].waits, vec![wait]);
    device.consume_waits(&waits).unwrap();
}

#[test]
fn environment_faces_fan_in_to_the_mip_pass() {
    let (device, render) = common::render_device(EngineConfig::default());
    let mut map = EnvironmentMap::new(&render, SceneNodeId(1), common::geometry(), None).unwrap();
    let scene = scene();
    update(&mut map, 0, &scene);

    let upstream = device.create_semaphore("Upstream").unwrap();
    device.signal_semaphore(upstream).unwrap();
    let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    let waits = map.render(&[wait], QueueKind::Graphics).unwrap();

    let submissions = device.submissions();
    // One relay handing the external wait to each face, six faces, the mips.
    assert_eq!(submissions.len(), 8);
    assert!(submissions[0].command_buffers.is_empty());
    assert_eq!(submissions[0].waits, vec![wait]);
    assert_eq!(submissions[0].signals.len(), 6);
    for face in &submissions[1..7] {
        assert_eq!(face.waits.len(), 1);
        assert!(submissions[0].signals.contains(&face.waits[0].semaphore));
    }
    assert_eq!(submissions[7].waits.len(), 6);
    assert_eq!(waits.len(), 1);
    device.consume_waits(&waits).unwrap();
    assert!(device.violations().is_empty());
}

#[test]
fn missing_environment_node_is_an_error() {
    let (_device, render) = common::render_device(EngineConfig::default());
    let mut map = EnvironmentMap::new(&render, SceneNodeId(42), common::geometry(), None).unwrap();
    let camera = Camera::default();
    let scene = scene();
    let result = map.update_cpu(&CpuUpdater {
        frame: 0,
        camera: &camera,
        scene: &scene,
    });
    assert!(result.is_err());
}

#[test]
fn nearest_spot_lights_render_side_by_side() {
    let config = EngineConfig {
        shadows: small_shadows(),
        ..EngineConfig::default()
    };
    let (device, render) = common::render_device(config);
    let mut spots = ShadowMap::new(&render, LightKind::Spot, common::geometry(), None).unwrap();
    let scene = scene();
    update(&mut spots, 0, &scene);

    let assigned: Vec<u64> = spots.assigned_lights().iter().map(|light| light.id).collect();
    assert_eq!(assigned, vec![3, 4]);

    let waits = spots.render(&[], QueueKind::Graphics).unwrap();
    let submissions = device.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|submission| submission.waits.is_empty()));
    // One wait per slot.
    assert_eq!(waits.len(), 2);
    assert!(submissions[0].signals.contains(&waits[0].semaphore));
    assert!(submissions[1].signals.contains(&waits[1].semaphore));
    device.consume_waits(&waits).unwrap();
    assert!(device.violations().is_empty());
}

#[test]
fn spot_slots_share_the_caller_wait_through_a_relay() {
    let config = EngineConfig {
        shadows: small_shadows(),
        ..EngineConfig::default()
    };
    let (device, render) = common::render_device(config);
    let mut spots = ShadowMap::new(&render, LightKind::Spot, common::geometry(), None).unwrap();
    let scene = scene();
    update(&mut spots, 0, &scene);

    let upstream = device.create_semaphore("Upstream").unwrap();
    device.signal_semaphore(upstream).unwrap();
    let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::TRANSFER);
    let waits = spots.render(&[wait], QueueKind::Graphics).unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 3);
    let relay = &submissions[0];
    assert!(relay.command_buffers.is_empty());
    assert_eq!(relay.waits, vec![wait]);
    assert_eq!(relay.signals.len(), 2);
    assert_eq!(submissions[1].waits[0].semaphore, relay.signals[0]);
    assert_eq!(submissions[2].waits[0].semaphore, relay.signals[1]);
    assert_eq!(submissions[1].waits[0].stage, vk::PipelineStageFlags::TRANSFER);
    device.consume_waits(&waits).unwrap();
    assert!(device.violations().is_empty());
}

#[test]
fn shadow_map_without_lights_forwards_its_input() {
    let config = EngineConfig {
        shadows: small_shadows(),
        ..EngineConfig::default()
    };
    let (device, render) = common::render_device(config);
    let mut spots = ShadowMap::new(&render, LightKind::Spot, common::geometry(), None).unwrap();
    update(&mut spots, 0, &StaticScene::default());

    let upstream = device.create_semaphore("Upstream").unwrap();
    let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::ALL_COMMANDS);
    let waits = spots.render(&[wait], QueueKind::Graphics).unwrap();
    assert_eq!(waits, vec![wait]);
    assert_eq!(device.submission_count(), 0);
}

#[test]
fn technique_runs_shadows_and_environment_side_by_side_before_voxels() {
    let config = EngineConfig {
        shadows: ShadowConfig {
            max_spot_lights: 1,
            ..small_shadows()
        },
        ..voxel_config(false)
    };
    let (device, render) = common::render_device(config);
    let mut progress = CountingProgress::default();
    let mut technique =
        RenderTechnique::new(&render, common::geometry(), Some(&mut progress)).unwrap();
    assert_eq!(progress.steps, progress.range);
    assert_eq!(technique.shadow_maps().len(), 2);
    assert!(technique.shadow_map(LightKind::Point).is_none());

    technique
        .add_environment_map(SceneNodeId(1), None)
        .unwrap();
    assert_eq!(
        technique.count_initialisation_steps(),
        progress.range + EnvironmentMap::count_initialisation_steps()
    );

    let scene = scene();
    update(&mut technique, 0, &scene);
    let waits = technique.pre_render(&[], QueueKind::Graphics).unwrap();

    let submissions = device.submissions();
    let graphs: Vec<String> = submissions
        .iter()
        .map(|submission| graph_of(&device, submission))
        .collect();
    let mut order = graphs.clone();
    order.dedup();
    assert_eq!(
        order,
        vec![
            "ShadowMapDirectional0",
            "ShadowMapSpot0",
            "EnvironmentMap0",
            "Voxelizer"
        ]
    );

    let signalled_by = |graph: &str| -> Vec<vk::Semaphore> {
        submissions
            .iter()
            .zip(&graphs)
            .filter(|(_, name)| name.as_str() == graph)
            .flat_map(|(submission, _)| submission.signals.clone())
            .collect()
    };
    let shadows: Vec<vk::Semaphore> = signalled_by("ShadowMapDirectional0")
        .into_iter()
        .chain(signalled_by("ShadowMapSpot0"))
        .collect();

    // No environment face waits on a shadow map.
    for (submission, _) in submissions
        .iter()
        .zip(&graphs)
        .filter(|(_, name)| name.as_str() == "EnvironmentMap0")
    {
        assert!(submission
            .waits
            .iter()
            .all(|wait| !shadows.contains(&wait.semaphore)));
    }

    // The first voxel stage waits on every independent chain.
    let first_voxels = graphs.iter().position(|name| name == "Voxelizer").unwrap();
    let voxel_waits: Vec<vk::Semaphore> = submissions[first_voxels]
        .waits
        .iter()
        .map(|wait| wait.semaphore)
        .collect();
    for graph in ["ShadowMapDirectional0", "ShadowMapSpot0", "EnvironmentMap0"] {
        let signalled = signalled_by(graph);
        assert!(
            voxel_waits.iter().any(|semaphore| signalled.contains(semaphore)),
            "voxels do not wait on {graph}"
        );
    }

    device.consume_waits(&waits).unwrap();
    assert!(device.violations().is_empty());
}

#[test]
fn removed_environment_maps_stop_rendering() {
    let (device, render) = common::render_device(EngineConfig {
        shadows: ShadowConfig {
            enabled: false,
            ..ShadowConfig::default()
        },
        ..EngineConfig::default()
    });
    let mut technique = RenderTechnique::new(&render, common::geometry(), None).unwrap();
    technique
        .add_environment_map(SceneNodeId(1), None)
        .unwrap();
    assert!(technique.remove_environment_map(SceneNodeId(1)));
    assert!(!technique.remove_environment_map(SceneNodeId(1)));

    let scene = scene();
    update(&mut technique, 0, &scene);
    let upstream = device.create_semaphore("Upstream").unwrap();
    let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::ALL_COMMANDS);
    let waits = technique.pre_render(&[wait], QueueKind::Graphics).unwrap();
    assert_eq!(waits, vec![wait]);
    assert_eq!(device.submission_count(), 0);
}
