//! Shader lookup.
//!
//! SPIR-V generation happens outside this crate; components ask a
//! [`ShaderLibrary`] for modules by name.

use castor3d_gpu::{GpuError, Result};
use hashbrown::HashMap;

pub const VOXELIZE_VERT: &str = "voxelize.vert";
pub const VOXELIZE_GEOM: &str = "voxelize.geom";
pub const VOXELIZE_FRAG: &str = "voxelize.frag";
pub const VOXEL_BUFFER_TO_TEXTURE: &str = "voxel_buffer_to_texture.comp";
pub const VOXEL_SECONDARY_BOUNCE: &str = "voxel_secondary_bounce.comp";
pub const ENVIRONMENT_VERT: &str = "environment.vert";
pub const ENVIRONMENT_FRAG: &str = "environment.frag";
pub const SHADOW_VERT: &str = "shadow.vert";
pub const SHADOW_FRAG: &str = "shadow.frag";
pub const SHADOW_BLUR: &str = "shadow_blur.comp";
pub const BRDF_LUT: &str = "brdf_lut.comp";
pub const RADIANCE: &str = "radiance.comp";
pub const PREFILTER: &str = "prefilter.comp";
pub const OVERLAY_VERT: &str = "overlay.vert";
pub const OVERLAY_FRAG: &str = "overlay.frag";
pub const OVERLAY_TEXT_VERT: &str = "overlay_text.vert";
pub const OVERLAY_TEXT_FRAG: &str = "overlay_text.frag";

/// Every module the renderer asks for.
pub const ALL: &[&str] = &[
    VOXELIZE_VERT,
    VOXELIZE_GEOM,
    VOXELIZE_FRAG,
    VOXEL_BUFFER_TO_TEXTURE,
    VOXEL_SECONDARY_BOUNCE,
    ENVIRONMENT_VERT,
    ENVIRONMENT_FRAG,
    SHADOW_VERT,
    SHADOW_FRAG,
    SHADOW_BLUR,
    BRDF_LUT,
    RADIANCE,
    PREFILTER,
    OVERLAY_VERT,
    OVERLAY_FRAG,
    OVERLAY_TEXT_VERT,
    OVERLAY_TEXT_FRAG,
];

/// Source of compiled SPIR-V modules.
pub trait ShaderLibrary: Send + Sync {
    /// SPIR-V words of the module `name`.
    fn shader(&self, name: &str) -> Result<Vec<u32>>;
}

/// Modules held in memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShaderLibrary {
    modules: HashMap<String, Vec<u32>>,
}

impl InMemoryShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, code: Vec<u32>) {
        self.modules.insert(name.into(), code);
    }

    /// A library answering every known name with a minimal module header.
    ///
    /// Only meaningful with devices that do not compile the code.
    pub fn placeholder() -> Self {
        let mut library = Self::new();
        for name in ALL {
            library.insert(*name, vec![0x0723_0203, 0x0001_0000, 0, 1, 0]);
        }
        library
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ShaderLibrary for InMemoryShaderLibrary {
    fn shader(&self, name: &str) -> Result<Vec<u32>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("shader {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_module_is_reported() {
        let library = InMemoryShaderLibrary::new();
        assert!(matches!(
            library.shader(SHADOW_VERT),
            Err(GpuError::ResourceNotFound(_))
        ));
        let library = InMemoryShaderLibrary::placeholder();
        assert_eq!(library.len(), ALL.len());
        assert!(library.shader(SHADOW_VERT).is_ok());
    }
}
