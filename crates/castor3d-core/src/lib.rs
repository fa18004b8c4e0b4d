//! Core types, configuration, and logging for the Castor3D renderer.
//!
//! This crate provides the foundational pieces shared by the GPU and render crates:
//! - Engine configuration (TOML loadable)
//! - Logging initialisation
//! - Math helpers (bounding boxes, alignment, hashing)
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;
pub mod math;

pub use config::{
    BufferPoolConfig, EngineConfig, EnvironmentConfig, IblConfig, OverlayConfig, ShadowConfig,
    VoxelConfig,
};
pub use error::{Error, Result};
pub use math::Aabb;
