//! Pooled GPU buffers.
//!
//! [`GpuBufferAllocator`] sub-allocates one buffer; [`GpuBuffer`] owns the
//! physical buffer and its allocator; the pools grow a set of those buffers
//! on demand.

mod allocator;
mod gpu_buffer;
mod object_pool;
mod uniform_pool;
mod vertex_pool;

pub use allocator::GpuBufferAllocator;
pub use gpu_buffer::{is_host_visible, GpuBuffer, GpuBufferDesc};
pub use object_pool::{ObjectBufferOffset, ObjectBufferPool, ObjectPoolDesc};
pub use uniform_pool::{UniformBufferOffset, UniformBufferPool};
pub use vertex_pool::{VertexBufferPool, VertexPoolDesc, VertexSlot};
