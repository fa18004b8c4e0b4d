//! Engine configuration.
//!
//! Every section carries serde defaults so a configuration file only needs to
//! name the values it overrides:
//!
//! ```toml
//! frames_in_flight = 3
//!
//! [voxels]
//! enabled = true
//! enable_secondary_bounce = true
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where a pooled buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferLocation {
    /// Device-local memory, filled through a staging copy.
    DeviceLocal,
    /// Host-visible memory, written directly.
    HostVisible,
}

/// Top-level configuration for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: u32,
    /// Frames a retired GPU object waits before it is destroyed.
    /// Defaults to `frames_in_flight` when absent.
    pub retire_after_frames: Option<u32>,
    pub buffers: BufferPoolConfig,
    pub overlays: OverlayConfig,
    pub voxels: VoxelConfig,
    pub shadows: ShadowConfig,
    pub environment: EnvironmentConfig,
    pub ibl: IblConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            retire_after_frames: None,
            buffers: BufferPoolConfig::default(),
            overlays: OverlayConfig::default(),
            voxels: VoxelConfig::default(),
            shadows: ShadowConfig::default(),
            environment: EnvironmentConfig::default(),
            ibl: IblConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Number of frames a retired resource is kept alive.
    pub fn retire_after(&self) -> u64 {
        u64::from(self.retire_after_frames.unwrap_or(self.frames_in_flight))
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        if self.retire_after_frames == Some(0) {
            return Err(Error::Config("retire_after_frames must be at least 1".into()));
        }
        self.buffers.validate()?;
        self.overlays.validate()?;
        self.voxels.validate()?;
        self.shadows.validate()?;
        if self.environment.face_size == 0 {
            return Err(Error::Config("environment.face_size must be non-zero".into()));
        }
        self.ibl.validate()
    }
}

/// Sizing of the pooled GPU buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Memory used for overlay vertex pools.
    pub vertex_location: BufferLocation,
    /// Memory used for uniform pools.
    pub uniform_location: BufferLocation,
    /// Each uniform buffer holds `2^uniform_level` aligned slots.
    pub uniform_level: u32,
    /// Each generic object buffer holds `2^object_level` blocks.
    pub object_level: u32,
    /// Smallest block handed out by a generic object buffer, in bytes.
    pub object_min_block_size: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            vertex_location: BufferLocation::DeviceLocal,
            uniform_location: BufferLocation::HostVisible,
            uniform_level: 10,
            object_level: 12,
            object_min_block_size: 256,
        }
    }
}

impl BufferPoolConfig {
    fn validate(&self) -> Result<()> {
        if self.uniform_level > 24 || self.object_level > 24 {
            return Err(Error::Config("buffer levels above 24 are not supported".into()));
        }
        if self.object_min_block_size == 0 {
            return Err(Error::Config("object_min_block_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Overlay batching limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Overlays sharing one physical vertex buffer.
    pub max_overlays_per_buffer: u32,
    /// Glyphs a single text overlay may draw.
    pub max_chars_per_overlay: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_overlays_per_buffer: 100,
            max_chars_per_overlay: 600,
        }
    }
}

impl OverlayConfig {
    fn validate(&self) -> Result<()> {
        if self.max_overlays_per_buffer == 0 {
            return Err(Error::Config("max_overlays_per_buffer must be at least 1".into()));
        }
        if self.max_chars_per_overlay == 0 {
            return Err(Error::Config("max_chars_per_overlay must be at least 1".into()));
        }
        Ok(())
    }
}

/// Voxel cone tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxelConfig {
    pub enabled: bool,
    pub enable_secondary_bounce: bool,
    pub enable_conservative_rasterization: bool,
    pub enable_temporal_smoothing: bool,
    /// Voxels per grid axis, a power of two.
    pub grid_size: u32,
    /// Scales the voxel size derived from the scene bounds.
    pub voxel_size_factor: f32,
    pub num_cones: u32,
    pub max_distance: f32,
    pub ray_step_size: f32,
}

impl Default for VoxelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_secondary_bounce: false,
            enable_conservative_rasterization: false,
            enable_temporal_smoothing: false,
            grid_size: 128,
            voxel_size_factor: 1.0,
            num_cones: 8,
            max_distance: 1.0,
            ray_step_size: 0.1,
        }
    }
}

impl VoxelConfig {
    fn validate(&self) -> Result<()> {
        if self.grid_size < 2 || !self.grid_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "voxels.grid_size must be a power of two >= 2, got {}",
                self.grid_size
            )));
        }
        if self.voxel_size_factor <= 0.0 {
            return Err(Error::Config("voxels.voxel_size_factor must be positive".into()));
        }
        Ok(())
    }

    /// Mip levels of a grid texture, down to 1x1x1.
    pub fn mip_levels(&self) -> u32 {
        self.grid_size.ilog2() + 1
    }
}

/// Shadow map limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Cascades of the directional shadow map, 1 to 4.
    pub directional_cascades: u32,
    pub max_directional_lights: u32,
    pub max_point_lights: u32,
    pub max_spot_lights: u32,
    /// Edge size of one shadow map face.
    pub map_size: u32,
    /// Run the variance blur after the depth passes.
    pub enable_blur: bool,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directional_cascades: 4,
            max_directional_lights: 1,
            max_point_lights: 6,
            max_spot_lights: 10,
            map_size: 1024,
            enable_blur: false,
        }
    }
}

impl ShadowConfig {
    fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.directional_cascades) {
            return Err(Error::Config(format!(
                "shadows.directional_cascades must be within 1..=4, got {}",
                self.directional_cascades
            )));
        }
        if self.map_size == 0 {
            return Err(Error::Config("shadows.map_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub face_size: u32,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self { face_size: 128 }
    }
}

/// Image based lighting texture sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IblConfig {
    pub brdf_size: u32,
    pub radiance_size: u32,
    pub prefiltered_size: u32,
}

impl Default for IblConfig {
    fn default() -> Self {
        Self {
            brdf_size: 512,
            radiance_size: 32,
            prefiltered_size: 128,
        }
    }
}

impl IblConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("brdf_size", self.brdf_size),
            ("radiance_size", self.radiance_size),
            ("prefiltered_size", self.prefiltered_size),
        ] {
            if !value.is_power_of_two() {
                return Err(Error::Config(format!(
                    "ibl.{name} must be a power of two, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Mip levels of the prefiltered environment map.
    pub fn prefiltered_mip_levels(&self) -> u32 {
        self.prefiltered_size.ilog2() + 1
    }
}
