//! Frame composition for the Castor3D renderer.
//!
//! This crate provides:
//! - A frame graph deriving submission order and semaphores from declared
//!   resource accesses
//! - The per-frame component contract (`update_cpu`, `update_gpu`, `render`, `accept`)
//! - Voxel cone tracing, environment map, shadow map and IBL pass chains
//! - Batched 2D overlay rendering
//! - The pre-render technique chaining them

pub mod camera;
pub mod component;
pub mod environment_map;
pub mod graph;
pub mod ibl;
pub mod overlay;
pub mod passes;
pub mod registry;
pub mod render_device;
pub mod scene;
pub mod shaders;
pub mod shadow_map;
pub mod technique;
pub mod voxelizer;

pub use camera::{Camera, CameraUniforms};
pub use component::{
    ComponentState, CountingProgress, CpuUpdater, FrameComponent, GpuUpdater, ProgressBar,
    RenderTechniqueVisitor,
};
pub use environment_map::EnvironmentMap;
pub use graph::{FrameGraph, PassDesc, RunnableGraph};
pub use ibl::IblTextures;
pub use overlay::{Overlay, OverlayRenderer, OverlayTarget, Preparer};
pub use registry::{InstanceRegistry, RegistryIndex};
pub use render_device::RenderDevice;
pub use scene::{
    LightData, LightKind, SceneGeometry, SceneGraphView, SceneNodeId, StaticGeometry, StaticScene,
};
pub use shaders::{InMemoryShaderLibrary, ShaderLibrary};
pub use shadow_map::ShadowMap;
pub use technique::RenderTechnique;
pub use voxelizer::Voxelizer;
