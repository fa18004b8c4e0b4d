//! Growable pool of sub-allocated buffers.

use super::gpu_buffer::{GpuBuffer, GpuBufferDesc};
use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// A byte range handed out by an [`ObjectBufferPool`].
///
/// Not `Clone`: the range is returned exactly once through
/// [`ObjectBufferPool::put_buffer`].
#[derive(Debug, PartialEq, Eq)]
pub struct ObjectBufferOffset {
    buffer_index: usize,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
}

impl ObjectBufferOffset {
    pub const fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size, not the rounded block size.
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn buffer_index(&self) -> usize {
        self.buffer_index
    }
}

/// Parameters of an [`ObjectBufferPool`].
#[derive(Debug, Clone)]
pub struct ObjectPoolDesc {
    pub name: String,
    pub level: u32,
    pub min_block_size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// Pool of [`GpuBuffer`]s of identical shape.
///
/// A request is served by the first buffer with room for it; when every
/// buffer is full a new one is appended. Buffers are never released before
/// the pool itself.
pub struct ObjectBufferPool {
    device: Arc<dyn Device>,
    desc: ObjectPoolDesc,
    buffers: Vec<GpuBuffer>,
}

impl ObjectBufferPool {
    /// Create an empty pool. Buffers are created on first use.
    pub fn new(device: Arc<dyn Device>, desc: ObjectPoolDesc) -> Self {
        Self {
            device,
            desc,
            buffers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Bytes held by one physical buffer.
    pub const fn buffer_capacity(&self) -> u64 {
        self.desc.min_block_size << self.desc.level
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &GpuBuffer> {
        self.buffers.iter()
    }

    /// Reserve `size` bytes, growing the pool when needed.
    pub fn get_buffer(&mut self, size: u64) -> Result<ObjectBufferOffset> {
        if size > self.buffer_capacity() {
            return Err(GpuError::AllocationFailed(format!(
                "{} bytes requested from pool {} whose buffers hold {} bytes",
                size,
                self.desc.name,
                self.buffer_capacity()
            )));
        }

        for (buffer_index, buffer) in self.buffers.iter_mut().enumerate() {
            if let Some(offset) = buffer.allocate(size) {
                return Ok(ObjectBufferOffset {
                    buffer_index,
                    buffer: buffer.buffer(),
                    offset,
                    size,
                });
            }
        }

        let buffer_index = self.buffers.len();
        let name = format!("{}/{}", self.desc.name, buffer_index);
        let mut buffer = GpuBuffer::initialise_storage(
            self.device.clone(),
            &GpuBufferDesc {
                name: &name,
                level: self.desc.level,
                min_block_size: self.desc.min_block_size,
                usage: self.desc.usage,
                location: self.desc.location,
            },
        )?;
        tracing::info!(pool = %self.desc.name, buffers = buffer_index + 1, "Grew object buffer pool");

        let offset = buffer.allocate(size).ok_or_else(|| {
            GpuError::AllocationFailed(format!("fresh buffer {name} cannot hold {size} bytes"))
        })?;
        let handle = buffer.buffer();
        self.buffers.push(buffer);

        Ok(ObjectBufferOffset {
            buffer_index,
            buffer: handle,
            offset,
            size,
        })
    }

    fn owning_buffer(&mut self, range: &ObjectBufferOffset) -> Result<&mut GpuBuffer> {
        self.buffers
            .get_mut(range.buffer_index)
            .filter(|buffer| buffer.buffer() == range.buffer)
            .ok_or_else(|| {
                GpuError::InvalidHandle(format!(
                    "range {range:?} does not belong to pool {}",
                    self.desc.name
                ))
            })
    }

    /// Return a range to its buffer.
    pub fn put_buffer(&mut self, range: ObjectBufferOffset) -> Result<()> {
        self.owning_buffer(&range)?.deallocate(range.offset)
    }

    /// Copy `data` to the start of `range`.
    pub fn write(&mut self, range: &ObjectBufferOffset, data: &[u8]) -> Result<()> {
        if data.len() as u64 > range.size {
            return Err(GpuError::InvalidState(format!(
                "{} bytes written to a {} byte range",
                data.len(),
                range.size
            )));
        }
        self.owning_buffer(range)?.upload(range.offset, data)
    }

    /// Record the transfers of every modified range.
    pub fn upload(&mut self, cb: vk::CommandBuffer) -> Result<bool> {
        let mut recorded = false;
        for buffer in &mut self.buffers {
            recorded |= buffer.flush(cb)?;
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn pool(device: Arc<MockDevice>) -> ObjectBufferPool {
        ObjectBufferPool::new(
            device,
            ObjectPoolDesc {
                name: "Objects".into(),
                level: 2,
                min_block_size: 64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::CpuToGpu,
            },
        )
    }

    #[test]
    fn grows_when_full() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device.clone());
        assert_eq!(pool.buffer_count(), 0);

        let ranges: Vec<_> = (0..5).map(|_| pool.get_buffer(64).unwrap()).collect();
        assert_eq!(pool.buffer_count(), 2);
        assert_eq!(ranges[3].buffer_index(), 0);
        assert_eq!(ranges[4].buffer_index(), 1);
        assert_eq!(ranges[4].offset(), 0);
        assert_eq!(device.live_buffer_count(), 2);
    }

    #[test]
    fn returned_range_is_reused_before_growing() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device);
        let mut ranges: Vec<_> = (0..4).map(|_| pool.get_buffer(64).unwrap()).collect();
        let second = ranges.remove(1);
        let offset = second.offset();
        pool.put_buffer(second).unwrap();

        let again = pool.get_buffer(10).unwrap();
        assert_eq!(again.offset(), offset);
        assert_eq!(pool.buffer_count(), 1);
    }

    #[test]
    fn oversize_request_fails() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device);
        assert!(matches!(
            pool.get_buffer(257),
            Err(GpuError::AllocationFailed(_))
        ));
    }

    #[test]
    fn write_is_bounded_by_range() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device.clone());
        let range = pool.get_buffer(8).unwrap();
        assert!(pool.write(&range, &[0; 9]).is_err());
        pool.write(&range, &[5; 8]).unwrap();
        let contents = device.buffer_contents(range.buffer()).unwrap();
        assert_eq!(&contents[..8], &[5; 8]);
    }

    #[test]
    fn foreign_range_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let mut first = pool(device.clone());
        let mut second = pool(device);
        let _ = second.get_buffer(64).unwrap();
        let range = first.get_buffer(64).unwrap();
        assert!(matches!(
            second.put_buffer(range),
            Err(GpuError::InvalidHandle(_))
        ));
    }
}
