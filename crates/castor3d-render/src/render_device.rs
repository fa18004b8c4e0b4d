//! The device, configuration and shared services components are built with.

use crate::registry::InstanceRegistry;
use crate::shaders::ShaderLibrary;
use castor3d_core::config::BufferLocation;
use castor3d_core::EngineConfig;
use castor3d_gpu::{Device, MemoryLocation, Result, UniformBufferPool};
use std::sync::Arc;

/// Everything a component needs to create its GPU objects.
#[derive(Clone)]
pub struct RenderDevice {
    device: Arc<dyn Device>,
    config: Arc<EngineConfig>,
    registry: InstanceRegistry,
    shaders: Arc<dyn ShaderLibrary>,
}

impl RenderDevice {
    /// Fails if `config` does not validate.
    pub fn new(
        device: Arc<dyn Device>,
        config: EngineConfig,
        shaders: Arc<dyn ShaderLibrary>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            frames_in_flight = config.frames_in_flight,
            retire_after = config.retire_after(),
            "Created render device"
        );
        Ok(Self {
            device,
            config: Arc::new(config),
            registry: InstanceRegistry::new(),
            shaders,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn shaders(&self) -> &dyn ShaderLibrary {
        &*self.shaders
    }

    /// A uniform pool placed where the configuration asks.
    pub fn uniform_pool(&self, name: &str) -> UniformBufferPool {
        UniformBufferPool::new(
            self.device.clone(),
            name,
            self.config.buffers.uniform_level,
            memory_location(self.config.buffers.uniform_location),
        )
    }
}

pub const fn memory_location(location: BufferLocation) -> MemoryLocation {
    match location {
        BufferLocation::DeviceLocal => MemoryLocation::GpuOnly,
        BufferLocation::HostVisible => MemoryLocation::CpuToGpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::InMemoryShaderLibrary;
    use castor3d_gpu::mock::MockDevice;
    use castor3d_gpu::GpuError;

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            frames_in_flight: 0,
            ..EngineConfig::default()
        };
        let result = RenderDevice::new(
            Arc::new(MockDevice::new()),
            config,
            Arc::new(InMemoryShaderLibrary::new()),
        );
        assert!(matches!(result, Err(GpuError::Other(_))));
    }
}
