//! GPU capability detection.

use crate::device::DeviceLimits;
use ash::vk;
use std::collections::HashSet;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Name of the conservative rasterization extension.
pub const CONSERVATIVE_RASTERIZATION: &str = "VK_EXT_conservative_rasterization";

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,
    pub device_local_memory_mb: u64,
    pub supports_geometry_shader: bool,
    pub limits: vk::PhysicalDeviceLimits,
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let available_extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default()
                .iter()
                .filter_map(|ext| {
                    ext.extension_name_as_c_str()
                        .ok()
                        .and_then(|name| name.to_str().ok())
                        .map(String::from)
                })
                .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            supports_geometry_shader: features.geometry_shader == vk::TRUE,
            limits: properties.limits,
            available_extensions,
        }
    }

    pub fn supports_conservative_rasterization(&self) -> bool {
        self.available_extensions.contains(CONSERVATIVE_RASTERIZATION)
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        api_major > 1 || (api_major == 1 && api_minor >= 3)
    }

    /// Limits exposed through [`crate::Device::limits`].
    pub fn device_limits(&self) -> DeviceLimits {
        DeviceLimits {
            min_uniform_buffer_offset_alignment: self.limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: self.limits.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: self.limits.non_coherent_atom_size,
            max_image_dimension_2d: self.limits.max_image_dimension2_d,
            max_image_dimension_3d: self.limits.max_image_dimension3_d,
            supports_geometry_shader: self.supports_geometry_shader,
            supports_conservative_rasterization: self.supports_conservative_rasterization(),
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}
