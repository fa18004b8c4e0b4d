//! Fixed-size slot batches for per-object vertex data.
//!
//! A [`VertexBufferPool`] serves slots of one runtime element size. Slots are
//! grouped in batches of `batch_size`, each batch backed by its own
//! [`GpuBuffer`]. Allocation takes the lowest free slot of the first batch
//! with room and appends a batch only when all are full; freed slots go back
//! to their batch and batches are never released while the pool lives.

use super::gpu_buffer::{GpuBuffer, GpuBufferDesc};
use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use castor3d_core::math::{align_up, ceil_log2};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Parameters of a [`VertexBufferPool`].
#[derive(Debug, Clone)]
pub struct VertexPoolDesc {
    pub name: String,
    /// Bytes of one slot.
    pub element_size: u64,
    /// Slots per physical buffer.
    pub batch_size: u32,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// A live slot. Consumed by [`VertexBufferPool::deallocate`].
#[derive(Debug, PartialEq, Eq)]
pub struct VertexSlot {
    batch: usize,
    slot: u32,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
}

impl VertexSlot {
    /// Index of the physical buffer holding the slot.
    pub const fn batch(&self) -> usize {
        self.batch
    }

    /// Index of the slot inside its batch.
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    pub const fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub const fn size(&self) -> u64 {
        self.size
    }
}

struct VertexBatch {
    buffer: GpuBuffer,
    /// Byte offset of each slot, reserved on first use and kept afterwards.
    offsets: Vec<Option<u64>>,
    occupied: Vec<bool>,
}

impl VertexBatch {
    fn free_slot(&self) -> Option<usize> {
        self.occupied.iter().position(|used| !used)
    }
}

/// Pool of fixed-size vertex slots.
pub struct VertexBufferPool {
    device: Arc<dyn Device>,
    desc: VertexPoolDesc,
    block_size: u64,
    batches: Vec<VertexBatch>,
}

impl VertexBufferPool {
    /// Create an empty pool. Batches are created on first use.
    pub fn new(device: Arc<dyn Device>, desc: VertexPoolDesc) -> Result<Self> {
        if desc.element_size == 0 || desc.batch_size == 0 {
            return Err(GpuError::InvalidState(format!(
                "vertex pool {} needs a non-zero element and batch size",
                desc.name
            )));
        }
        let block_size = align_up(desc.element_size, 16);
        Ok(Self {
            device,
            desc,
            block_size,
            batches: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub const fn element_size(&self) -> u64 {
        self.desc.element_size
    }

    pub const fn batch_size(&self) -> u32 {
        self.desc.batch_size
    }

    /// Physical buffers created so far.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Slots currently handed out.
    pub fn live_count(&self) -> usize {
        self.batches
            .iter()
            .map(|batch| batch.occupied.iter().filter(|&&used| used).count())
            .sum()
    }

    fn push_batch(&mut self) -> Result<usize> {
        let index = self.batches.len();
        let name = format!("{}/{}", self.desc.name, index);
        let buffer = GpuBuffer::initialise_storage(
            self.device.clone(),
            &GpuBufferDesc {
                name: &name,
                level: ceil_log2(u64::from(self.desc.batch_size)),
                min_block_size: self.block_size,
                usage: self.desc.usage,
                location: self.desc.location,
            },
        )?;
        let slots = self.desc.batch_size as usize;
        self.batches.push(VertexBatch {
            buffer,
            offsets: vec![None; slots],
            occupied: vec![false; slots],
        });
        tracing::info!(pool = %self.desc.name, batches = index + 1, "Grew vertex buffer pool");
        Ok(index)
    }

    /// Take the lowest free slot, appending a batch when every batch is full.
    pub fn allocate(&mut self) -> Result<VertexSlot> {
        let found = self
            .batches
            .iter()
            .enumerate()
            .find_map(|(index, batch)| batch.free_slot().map(|slot| (index, slot)));
        let (batch_index, slot) = match found {
            Some(found) => found,
            None => (self.push_batch()?, 0),
        };

        let element_size = self.desc.element_size;
        let batch = &mut self.batches[batch_index];
        let offset = match batch.offsets[slot] {
            Some(offset) => offset,
            None => {
                let offset = batch.buffer.allocate(element_size).ok_or_else(|| {
                    GpuError::AllocationFailed(format!(
                        "batch {} has no block left for slot {slot}",
                        batch.buffer.name()
                    ))
                })?;
                batch.offsets[slot] = Some(offset);
                offset
            }
        };
        batch.occupied[slot] = true;

        Ok(VertexSlot {
            batch: batch_index,
            slot: slot as u32,
            buffer: batch.buffer.buffer(),
            offset,
            size: element_size,
        })
    }

    fn live_batch(&mut self, slot: &VertexSlot) -> Result<&mut VertexBatch> {
        self.batches
            .get_mut(slot.batch)
            .filter(|batch| {
                batch.buffer.buffer() == slot.buffer
                    && batch.occupied.get(slot.slot as usize) == Some(&true)
            })
            .ok_or_else(|| {
                GpuError::InvalidHandle(format!(
                    "slot {}:{} is not live in pool {}",
                    slot.batch, slot.slot, self.desc.name
                ))
            })
    }

    /// Return a slot to its batch. Its byte range stays reserved for reuse.
    pub fn deallocate(&mut self, slot: VertexSlot) -> Result<()> {
        let batch = self.live_batch(&slot)?;
        batch.occupied[slot.slot as usize] = false;
        Ok(())
    }

    /// Copy `data` into a slot.
    pub fn write(&mut self, slot: &VertexSlot, data: &[u8]) -> Result<()> {
        if data.len() as u64 > slot.size {
            return Err(GpuError::InvalidState(format!(
                "{} bytes written to a {} byte slot",
                data.len(),
                slot.size
            )));
        }
        let batch = self.live_batch(slot)?;
        batch.buffer.upload(slot.offset, data)
    }

    /// Record the transfers of every modified slot.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload(&mut self, cb: vk::CommandBuffer) -> Result<bool> {
        let mut recorded = false;
        for batch in &mut self.batches {
            recorded |= batch.buffer.flush(cb)?;
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn pool(device: Arc<MockDevice>, batch_size: u32) -> VertexBufferPool {
        VertexBufferPool::new(
            device,
            VertexPoolDesc {
                name: "Panels".into(),
                element_size: 6 * 16,
                batch_size,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
            },
        )
        .unwrap()
    }

    #[test]
    fn batch_of_two_scenario() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device, 2);

        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        let third = pool.allocate().unwrap();
        assert_eq!(pool.batch_count(), 2);
        assert_eq!((first.batch(), first.slot()), (0, 0));
        assert_eq!((second.batch(), second.slot()), (0, 1));
        assert_eq!((third.batch(), third.slot()), (1, 0));

        let freed_offset = second.offset();
        pool.deallocate(second).unwrap();
        let again = pool.allocate().unwrap();
        assert_eq!((again.batch(), again.slot()), (0, 1));
        assert_eq!(again.offset(), freed_offset);
        assert_eq!(pool.batch_count(), 2);
        assert_eq!(pool.live_count(), 3);
    }

    #[test]
    fn growth_keeps_existing_slots() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device, 3);
        let early: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        let ranges: Vec<_> = early.iter().map(|s| (s.buffer(), s.offset())).collect();
        for (index, slot) in early.iter().enumerate() {
            pool.write(slot, &[index as u8; 96]).unwrap();
        }

        let late: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.batch_count(), 3);
        for slot in &late {
            assert!(!ranges.contains(&(slot.buffer(), slot.offset())));
        }
        // Early slots are still live and writable after growth.
        for slot in &early {
            pool.write(slot, &[0xff; 16]).unwrap();
        }
    }

    #[test]
    fn slot_ranges_never_overlap() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device, 4);
        let slots: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        let mut offsets: Vec<_> = slots.iter().map(VertexSlot::offset).collect();
        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 96);
        }
    }

    #[test]
    fn stale_slot_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device, 2);
        let slot = pool.allocate().unwrap();
        let forged = VertexSlot {
            batch: slot.batch,
            slot: slot.slot,
            buffer: slot.buffer,
            offset: slot.offset,
            size: slot.size,
        };
        pool.deallocate(slot).unwrap();
        assert!(matches!(
            pool.deallocate(forged),
            Err(GpuError::InvalidHandle(_))
        ));
    }

    #[test]
    fn oversized_write_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device, 1);
        let slot = pool.allocate().unwrap();
        assert!(pool.write(&slot, &[0; 97]).is_err());
    }

    #[test]
    fn upload_records_once_per_dirty_batch() {
        let device = Arc::new(MockDevice::new());
        let mut pool = pool(device.clone(), 1);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.write(&a, &[1; 96]).unwrap();

        let cb = device.allocate_command_buffer(crate::device::QueueKind::Graphics).unwrap();
        device
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        assert!(pool.upload(cb).unwrap());
        // One copy and one barrier, only for the written batch.
        assert_eq!(device.recorded_commands(cb).len(), 2);
        assert!(!pool.upload(cb).unwrap());
    }

    #[test]
    fn zero_batch_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let result = VertexBufferPool::new(
            device,
            VertexPoolDesc {
                name: "Empty".into(),
                element_size: 16,
                batch_size: 0,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
            },
        );
        assert!(result.is_err());
    }
}
