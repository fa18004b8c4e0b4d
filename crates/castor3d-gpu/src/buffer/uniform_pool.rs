//! Pool of typed uniform buffer slots.

use super::object_pool::{ObjectBufferOffset, ObjectBufferPool, ObjectPoolDesc};
use crate::device::{DescriptorWrite, Device};
use crate::error::Result;
use ash::vk;
use bytemuck::Pod;
use castor3d_core::math::align_up;
use gpu_allocator::MemoryLocation;
use std::marker::PhantomData;
use std::sync::Arc;

/// A uniform slot holding one `T`.
#[derive(Debug)]
pub struct UniformBufferOffset<T> {
    range: ObjectBufferOffset,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod> UniformBufferOffset<T> {
    pub const fn buffer(&self) -> vk::Buffer {
        self.range.buffer()
    }

    pub const fn offset(&self) -> u64 {
        self.range.offset()
    }

    pub const fn range(&self) -> u64 {
        std::mem::size_of::<T>() as u64
    }

    /// Descriptor update binding this slot.
    pub const fn descriptor_write(&self, binding: u32) -> DescriptorWrite {
        DescriptorWrite::UniformBuffer {
            binding,
            buffer: self.buffer(),
            offset: self.offset(),
            range: self.range(),
        }
    }
}

/// Hands out uniform slots aligned to the device's uniform offset alignment.
pub struct UniformBufferPool {
    pool: ObjectBufferPool,
}

impl UniformBufferPool {
    /// Each physical buffer holds `2^level` slots of the minimum alignment.
    pub fn new(
        device: Arc<dyn Device>,
        name: impl Into<String>,
        level: u32,
        location: MemoryLocation,
    ) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment.max(16);
        let pool = ObjectBufferPool::new(
            device,
            ObjectPoolDesc {
                name: name.into(),
                level,
                min_block_size: alignment,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location,
            },
        );
        Self { pool }
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.buffer_count()
    }

    /// Reserve a slot for one `T`.
    pub fn get_buffer<T: Pod>(&mut self) -> Result<UniformBufferOffset<T>> {
        let size = align_up(std::mem::size_of::<T>() as u64, 16);
        let range = self.pool.get_buffer(size)?;
        Ok(UniformBufferOffset {
            range,
            _marker: PhantomData,
        })
    }

    pub fn put_buffer<T: Pod>(&mut self, slot: UniformBufferOffset<T>) -> Result<()> {
        self.pool.put_buffer(slot.range)
    }

    /// Store `value` in the slot.
    pub fn write<T: Pod>(&mut self, slot: &UniformBufferOffset<T>, value: &T) -> Result<()> {
        self.pool.write(&slot.range, bytemuck::bytes_of(value))
    }

    /// Record the transfers of every modified slot.
    pub fn upload(&mut self, cb: vk::CommandBuffer) -> Result<bool> {
        self.pool.upload(cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Transform {
        matrix: [f32; 16],
        tint: [f32; 4],
    }

    #[test]
    fn slots_respect_alignment() {
        let device = Arc::new(MockDevice::new());
        let mut pool =
            UniformBufferPool::new(device, "Transforms", 3, MemoryLocation::CpuToGpu);
        let a = pool.get_buffer::<Transform>().unwrap();
        let b = pool.get_buffer::<Transform>().unwrap();
        assert_eq!(a.offset() % 256, 0);
        assert_eq!(b.offset() % 256, 0);
        assert_ne!(a.offset(), b.offset());
        assert_eq!(a.range(), 80);
    }

    #[test]
    fn write_lands_at_slot() {
        let device = Arc::new(MockDevice::new());
        let mut pool =
            UniformBufferPool::new(device.clone(), "Transforms", 3, MemoryLocation::CpuToGpu);
        let _first = pool.get_buffer::<Transform>().unwrap();
        let slot = pool.get_buffer::<Transform>().unwrap();
        let value = Transform {
            matrix: [1.0; 16],
            tint: [0.5; 4],
        };
        pool.write(&slot, &value).unwrap();

        let contents = device.buffer_contents(slot.buffer()).unwrap();
        let start = slot.offset() as usize;
        assert_eq!(
            &contents[start..start + 80],
            bytemuck::bytes_of(&value)
        );
        assert!(matches!(
            slot.descriptor_write(4),
            DescriptorWrite::UniformBuffer { binding: 4, range: 80, .. }
        ));
    }

    #[test]
    fn grows_past_one_buffer() {
        let device = Arc::new(MockDevice::new());
        let mut pool = UniformBufferPool::new(device, "Small", 1, MemoryLocation::CpuToGpu);
        let slots: Vec<_> = (0..3)
            .map(|_| pool.get_buffer::<Transform>().unwrap())
            .collect();
        assert_eq!(pool.buffer_count(), 2);
        for slot in slots {
            pool.put_buffer(slot).unwrap();
        }
    }
}
