//! Pre-render composition of the pass chains a frame needs before the
//! opaque scene is drawn.
//!
//! Shadow maps and environment maps do not read each other's output, so
//! they all start from the caller's waits. Voxel cone tracing waits on every
//! one of them, and its waits are what the frame returns.

use crate::component::{
    reborrow, ComponentState, CpuUpdater, FrameComponent, GpuUpdater, ProgressBar,
    RenderTechniqueVisitor, UpdateTracker,
};
use crate::environment_map::EnvironmentMap;
use crate::render_device::RenderDevice;
use crate::scene::{LightKind, SceneGeometry, SceneNodeId};
use crate::shadow_map::{slot_count, ShadowMap};
use crate::voxelizer::Voxelizer;
use castor3d_core::EngineConfig;
use castor3d_gpu::{QueueKind, Result, SemaphoreRelay, SemaphoreWait, SemaphoreWaitArray};
use std::sync::Arc;

const LIGHT_KINDS: [LightKind; 3] = [LightKind::Directional, LightKind::Point, LightKind::Spot];

pub struct RenderTechnique {
    render: RenderDevice,
    geometry: Arc<dyn SceneGeometry>,
    tracker: UpdateTracker,
    shadow_maps: Vec<ShadowMap>,
    environment_maps: Vec<EnvironmentMap>,
    voxelizer: Option<Voxelizer>,
    relay: SemaphoreRelay,
}

impl RenderTechnique {
    /// Create the shadow maps of every light type with slots and the
    /// voxelizer when enabled.
    pub fn new(
        render: &RenderDevice,
        geometry: Arc<dyn SceneGeometry>,
        mut progress: Option<&mut dyn ProgressBar>,
    ) -> Result<Self> {
        if let Some(progress) = progress.as_deref_mut() {
            progress.set_range(Self::count_initialisation_steps_for(render.config()));
        }

        let mut shadow_maps = Vec::new();
        if render.config().shadows.enabled {
            for kind in LIGHT_KINDS {
                if slot_count(&render.config().shadows, kind) > 0 {
                    shadow_maps.push(ShadowMap::new(
                        render,
                        kind,
                        geometry.clone(),
                        reborrow(&mut progress),
                    )?);
                }
            }
        }
        let voxelizer = if render.config().voxels.enabled {
            Some(Voxelizer::new(render, geometry.clone(), reborrow(&mut progress))?)
        } else {
            None
        };

        tracing::info!(
            shadow_maps = shadow_maps.len(),
            voxels = voxelizer.is_some(),
            "Initialised render technique"
        );
        Ok(Self {
            render: render.clone(),
            geometry,
            tracker: UpdateTracker::ready(),
            shadow_maps,
            environment_maps: Vec::new(),
            voxelizer,
            relay: SemaphoreRelay::new(render.device().clone(), "RenderTechnique"),
        })
    }

    /// Steps [`RenderTechnique::new`] reports for `config`. Environment maps
    /// are added later and counted by [`EnvironmentMap::count_initialisation_steps`].
    pub fn count_initialisation_steps_for(config: &EngineConfig) -> u32 {
        let shadows: u32 = if config.shadows.enabled {
            LIGHT_KINDS
                .iter()
                .filter(|&&kind| slot_count(&config.shadows, kind) > 0)
                .map(|&kind| ShadowMap::count_initialisation_steps_for(&config.shadows, kind))
                .sum()
        } else {
            0
        };
        let voxels = if config.voxels.enabled {
            Voxelizer::count_initialisation_steps()
        } else {
            0
        };
        shadows + voxels
    }

    /// Render a cube map around `node`. Returns its position in
    /// [`RenderTechnique::environment_maps`].
    pub fn add_environment_map(
        &mut self,
        node: SceneNodeId,
        progress: Option<&mut dyn ProgressBar>,
    ) -> Result<usize> {
        let map = EnvironmentMap::new(&self.render, node, self.geometry.clone(), progress)?;
        self.environment_maps.push(map);
        Ok(self.environment_maps.len() - 1)
    }

    /// Stop rendering the cube map of `node`. Returns whether one existed.
    pub fn remove_environment_map(&mut self, node: SceneNodeId) -> bool {
        let before = self.environment_maps.len();
        self.environment_maps.retain(|map| map.node() != node);
        before != self.environment_maps.len()
    }

    pub fn shadow_maps(&self) -> &[ShadowMap] {
        &self.shadow_maps
    }

    pub fn shadow_map(&self, kind: LightKind) -> Option<&ShadowMap> {
        self.shadow_maps.iter().find(|map| map.kind() == kind)
    }

    pub fn environment_maps(&self) -> &[EnvironmentMap] {
        &self.environment_maps
    }

    pub fn voxelizer(&self) -> Option<&Voxelizer> {
        self.voxelizer.as_ref()
    }

    pub fn voxelizer_mut(&mut self) -> Option<&mut Voxelizer> {
        self.voxelizer.as_mut()
    }

    /// Every component, the voxelizer last.
    fn components_mut(&mut self) -> impl Iterator<Item = &mut dyn FrameComponent> {
        self.shadow_maps
            .iter_mut()
            .map(|map| map as &mut dyn FrameComponent)
            .chain(
                self.environment_maps
                    .iter_mut()
                    .map(|map| map as &mut dyn FrameComponent),
            )
            .chain(
                self.voxelizer
                    .iter_mut()
                    .map(|voxelizer| voxelizer as &mut dyn FrameComponent),
            )
    }

    /// Shadows and environment maps side by side, then voxels after all of
    /// them.
    pub fn pre_render(
        &mut self,
        to_wait: &[SemaphoreWait],
        queue: QueueKind,
    ) -> Result<SemaphoreWaitArray> {
        let count = self.shadow_maps.len() + self.environment_maps.len();
        let mut waits = if count == 0 {
            to_wait.to_vec()
        } else {
            SemaphoreWaitArray::new()
        };
        let inputs = self.relay.split(to_wait, queue, count)?;
        let independent = self
            .shadow_maps
            .iter_mut()
            .map(|map| map as &mut dyn FrameComponent)
            .chain(
                self.environment_maps
                    .iter_mut()
                    .map(|map| map as &mut dyn FrameComponent),
            );
        for (component, input) in independent.zip(&inputs) {
            waits.extend(component.render(input, queue)?);
        }
        if let Some(voxelizer) = &mut self.voxelizer {
            waits = voxelizer.render(&waits, queue)?;
        }
        Ok(waits)
    }
}

impl FrameComponent for RenderTechnique {
    fn name(&self) -> &str {
        "RenderTechnique"
    }

    fn state(&self) -> ComponentState {
        self.tracker.state
    }

    fn update_cpu(&mut self, updater: &CpuUpdater<'_>) -> Result<()> {
        for component in self.components_mut() {
            component.update_cpu(updater)?;
        }
        self.tracker.cpu_updated(updater.frame);
        Ok(())
    }

    fn update_gpu(&mut self, updater: &GpuUpdater) -> Result<()> {
        self.tracker.check_gpu_update("RenderTechnique", updater.frame)?;
        for component in self.components_mut() {
            component.update_gpu(updater)?;
        }
        Ok(())
    }

    fn render(&mut self, to_wait: &[SemaphoreWait], queue: QueueKind) -> Result<SemaphoreWaitArray> {
        let waits = self.pre_render(to_wait, queue)?;
        self.tracker.rendered();
        Ok(waits)
    }

    fn accept(&self, visitor: &mut dyn RenderTechniqueVisitor) {
        for map in &self.shadow_maps {
            map.accept(visitor);
        }
        for map in &self.environment_maps {
            map.accept(visitor);
        }
        if let Some(voxelizer) = &self.voxelizer {
            voxelizer.accept(visitor);
        }
    }

    fn count_initialisation_steps(&self) -> u32 {
        Self::count_initialisation_steps_for(self.render.config())
            + self
                .environment_maps
                .iter()
                .map(FrameComponent::count_initialisation_steps)
                .sum::<u32>()
    }
}
