//! Vulkan backend.

mod capabilities;
mod device;
mod instance;
mod pipeline;

pub use capabilities::{GpuCapabilities, GpuVendor, CONSERVATIVE_RASTERIZATION};
pub use device::{VulkanDevice, VulkanDeviceBuilder};
pub use instance::{create_instance, select_physical_device, validation_layers};
pub use pipeline::{create_compute_pipeline, create_graphics_pipeline};
