//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error not covered by a more specific variant.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Device or host memory exhausted.
    #[error("Device out of memory: {0}")]
    DeviceOutOfMemory(String),

    /// Format or usage combination rejected by the device.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompileFailed(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A handle or offset that is not live was used.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A frame graph contains a dependency cycle.
    #[error("Dependency cycle in frame graph {0}")]
    GraphCycle(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::DeviceOutOfMemory(result.to_string())
            }
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::UnsupportedFormat(result.to_string()),
            other => Self::Vulkan(other),
        }
    }
}

impl From<castor3d_core::Error> for GpuError {
    fn from(err: castor3d_core::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_errors_are_classified() {
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::DeviceOutOfMemory(_)
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            GpuError::UnsupportedFormat(_)
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
    }
}
