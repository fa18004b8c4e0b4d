//! What the pass chains need from the scene, which lives elsewhere.
//!
//! Components never hold references into the scene. They keep a
//! [`SceneNodeId`] and resolve it through a [`SceneGraphView`] each update,
//! so a removed node shows up as a missing id instead of a dangling borrow.

use castor3d_core::Aabb;
use castor3d_gpu::{vk, Device, Pipeline, Result};
use glam::Vec3;

/// Bytes per scene vertex: position, normal and texture coordinates.
pub const SCENE_VERTEX_STRIDE: u32 = 32;

/// Vertex input layout of scene geometry.
pub fn scene_vertex_input() -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: SCENE_VERTEX_STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attribute = |location, format, offset| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset,
    };
    (
        vec![binding],
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, 0),
            attribute(1, vk::Format::R32G32B32_SFLOAT, 12),
            attribute(2, vk::Format::R32G32_SFLOAT, 24),
        ],
    )
}

/// Stable identifier of a scene node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SceneNodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
}

/// A light as the shadow maps see it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightData {
    pub id: u64,
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    /// Full cone angle in radians, spot lights only.
    pub cone_angle: f32,
    pub casts_shadows: bool,
}

impl LightData {
    pub fn directional(id: u64, direction: Vec3) -> Self {
        Self {
            id,
            kind: LightKind::Directional,
            position: Vec3::ZERO,
            direction: direction.normalize_or(Vec3::NEG_Y),
            range: f32::INFINITY,
            cone_angle: 0.0,
            casts_shadows: true,
        }
    }

    pub fn point(id: u64, position: Vec3, range: f32) -> Self {
        Self {
            id,
            kind: LightKind::Point,
            position,
            direction: Vec3::NEG_Y,
            range,
            cone_angle: 0.0,
            casts_shadows: true,
        }
    }

    pub fn spot(id: u64, position: Vec3, direction: Vec3, range: f32, cone_angle: f32) -> Self {
        Self {
            id,
            kind: LightKind::Spot,
            position,
            direction: direction.normalize_or(Vec3::NEG_Y),
            range,
            cone_angle,
            casts_shadows: true,
        }
    }
}

/// Read access to the scene graph.
pub trait SceneGraphView {
    /// World position of a node, `None` once the node is gone.
    fn node_position(&self, id: SceneNodeId) -> Option<Vec3>;
    fn scene_bounds(&self) -> Aabb;
    fn lights(&self) -> &[LightData];
}

/// Records the draws of the scene's geometry with a bound pipeline.
pub trait SceneGeometry: Send + Sync {
    fn record_draws(
        &self,
        device: &dyn Device,
        cb: vk::CommandBuffer,
        pipeline: &Pipeline,
    ) -> Result<()>;
}

/// A scene with a fixed set of nodes and lights.
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    pub nodes: Vec<(SceneNodeId, Vec3)>,
    pub bounds: Aabb,
    pub lights: Vec<LightData>,
}

impl SceneGraphView for StaticScene {
    fn node_position(&self, id: SceneNodeId) -> Option<Vec3> {
        self.nodes
            .iter()
            .find(|(node, _)| *node == id)
            .map(|&(_, position)| position)
    }

    fn scene_bounds(&self) -> Aabb {
        self.bounds
    }

    fn lights(&self) -> &[LightData] {
        &self.lights
    }
}

/// Non-indexed meshes living in vertex buffers owned by the caller.
#[derive(Debug, Clone, Default)]
pub struct StaticGeometry {
    /// `(buffer, offset, vertex count)` per mesh.
    pub meshes: Vec<(vk::Buffer, u64, u32)>,
}

impl SceneGeometry for StaticGeometry {
    fn record_draws(
        &self,
        device: &dyn Device,
        cb: vk::CommandBuffer,
        _pipeline: &Pipeline,
    ) -> Result<()> {
        for &(buffer, offset, vertex_count) in &self.meshes {
            device.cmd_bind_vertex_buffer(cb, 0, buffer, offset);
            device.cmd_draw(cb, vertex_count, 1);
        }
        Ok(())
    }
}
