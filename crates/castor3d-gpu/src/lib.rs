//! Vulkan device abstraction and GPU resource pooling for the Castor3D renderer.
//!
//! This crate provides:
//! - The [`Device`] trait and its Vulkan implementation
//! - Buddy-allocated buffer pools for per-object, uniform and vertex data
//! - Command buffers paired with completion semaphores
//! - Descriptor, image and pipeline ownership
//! - Deferred release of resources still used by frames in flight

pub mod buffer;
pub mod command;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pipeline;
pub mod sync;
pub mod vulkan;

pub use buffer::{
    GpuBuffer, GpuBufferAllocator, GpuBufferDesc, ObjectBufferOffset, ObjectBufferPool,
    ObjectPoolDesc, UniformBufferOffset, UniformBufferPool, VertexBufferPool, VertexPoolDesc,
    VertexSlot,
};
pub use command::{execute_single_time_commands, CommandsSemaphore};
pub use deferred::RetirementQueue;
pub use descriptors::{DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use device::{
    color_range, BufferBarrier, BufferDesc, ColorAttachment, DepthAttachment, DescriptorBinding,
    DescriptorWrite, Device, DeviceLimits, ImageBarrier, ImageDesc, ImageViewDesc, QueueKind,
    QueueSubmit, RenderingDesc, SamplerDesc,
};
pub use error::{GpuError, Result};
pub use image::{aspect_mask, full_mip_count, GpuImage, Sampler};
pub use pipeline::{BlendMode, GraphicsPipelineConfig, Pipeline};
pub use sync::{
    split_waits, FrameTracker, SemaphoreRelay, SemaphoreWait, SemaphoreWaitArray,
};
pub use vulkan::{GpuCapabilities, GpuVendor, VulkanDevice, VulkanDeviceBuilder};

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
