//! One physical buffer with a block allocator over its bytes.

use super::allocator::GpuBufferAllocator;
use crate::device::{BufferBarrier, BufferDesc, Device};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::ops::Range;
use std::sync::Arc;

/// Parameters of [`GpuBuffer::initialise_storage`].
#[derive(Debug, Clone, Copy)]
pub struct GpuBufferDesc<'a> {
    pub name: &'a str,
    /// The buffer holds `2^level` blocks.
    pub level: u32,
    pub min_block_size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// Whether memory at `location` can be mapped.
pub const fn is_host_visible(location: MemoryLocation) -> bool {
    matches!(location, MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu)
}

/// A physical GPU buffer handing out byte ranges.
///
/// Writes go to a host-side copy of the contents. On host-visible memory they
/// are written through immediately; on device-local memory the touched ranges
/// are remembered and copied by [`GpuBuffer::flush`] through a staging buffer.
pub struct GpuBuffer {
    device: Arc<dyn Device>,
    name: String,
    buffer: vk::Buffer,
    staging: Option<vk::Buffer>,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    allocator: GpuBufferAllocator,
    contents: Vec<u8>,
    /// Byte ranges modified since the last flush.
    dirty: Vec<Range<u64>>,
}

impl GpuBuffer {
    /// Create the physical buffer, sized `min_block_size << level`, and its allocator.
    pub fn initialise_storage(device: Arc<dyn Device>, desc: &GpuBufferDesc<'_>) -> Result<Self> {
        let allocator = GpuBufferAllocator::new(desc.level, desc.min_block_size);
        let size = allocator.capacity();
        let host_visible = is_host_visible(desc.location);
        let usage = if host_visible {
            desc.usage
        } else {
            desc.usage | vk::BufferUsageFlags::TRANSFER_DST
        };

        let buffer = device.create_buffer(&BufferDesc {
            name: desc.name,
            size,
            usage,
            location: desc.location,
        })?;

        let staging = if host_visible {
            None
        } else {
            let staging_name = format!("{}/Staging", desc.name);
            match device.create_buffer(&BufferDesc {
                name: &staging_name,
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
            }) {
                Ok(staging) => Some(staging),
                Err(err) => {
                    device.destroy_buffer(buffer);
                    return Err(err);
                }
            }
        };

        tracing::debug!(
            name = desc.name,
            size,
            location = ?desc.location,
            "Created pooled buffer"
        );

        Ok(Self {
            device,
            name: desc.name.to_owned(),
            buffer,
            staging,
            usage,
            location: desc.location,
            allocator,
            contents: vec![0; size as usize],
            dirty: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub const fn location(&self) -> MemoryLocation {
        self.location
    }

    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub const fn capacity(&self) -> u64 {
        self.allocator.capacity()
    }

    pub const fn is_host_visible(&self) -> bool {
        is_host_visible(self.location)
    }

    pub const fn allocator(&self) -> &GpuBufferAllocator {
        &self.allocator
    }

    pub fn has_available(&self, size: u64) -> bool {
        self.allocator.has_available(size)
    }

    /// Reserve `size` bytes, `None` when the buffer is full.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        self.allocator.allocate(size)
    }

    pub fn deallocate(&mut self, offset: u64) -> Result<()> {
        self.allocator.deallocate(offset)
    }

    fn checked_range(&self, offset: u64, size: u64) -> Result<Range<usize>> {
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.capacity())
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "range {offset}+{size} exceeds buffer {} of {} bytes",
                    self.name,
                    self.capacity()
                ))
            })?;
        Ok(offset as usize..end as usize)
    }

    /// Host view of a byte range. Changes are published by [`GpuBuffer::unlock`].
    pub fn lock(&mut self, offset: u64, size: u64) -> Result<&mut [u8]> {
        let range = self.checked_range(offset, size)?;
        Ok(&mut self.contents[range])
    }

    /// Publish a range previously modified through [`GpuBuffer::lock`].
    pub fn unlock(&mut self, offset: u64, size: u64) -> Result<()> {
        let range = self.checked_range(offset, size)?;
        if size == 0 {
            return Ok(());
        }
        if self.is_host_visible() {
            self.device
                .write_buffer(self.buffer, offset, &self.contents[range])?;
        } else {
            self.dirty.push(offset..offset + size);
        }
        Ok(())
    }

    /// Copy `data` to `offset`.
    pub fn upload(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        self.lock(offset, size)?.copy_from_slice(data);
        self.unlock(offset, size)
    }

    /// Read back `out.len()` bytes from `offset`. Host-visible memory only.
    pub fn download(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.checked_range(offset, out.len() as u64)?;
        if !self.is_host_visible() {
            return Err(GpuError::InvalidState(format!(
                "buffer {} is device-local and cannot be read back",
                self.name
            )));
        }
        self.device.read_buffer(self.buffer, offset, out)
    }

    /// Ranges waiting for [`GpuBuffer::flush`].
    pub fn pending_ranges(&self) -> usize {
        self.dirty.len()
    }

    /// Record the copies publishing every modified range, followed by a
    /// barrier making them visible to the buffer's consumers.
    ///
    /// Returns whether anything was recorded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&mut self, cb: vk::CommandBuffer) -> Result<bool> {
        let Some(staging) = self.staging else {
            return Ok(false);
        };
        if self.dirty.is_empty() {
            return Ok(false);
        }

        let ranges = coalesce(std::mem::take(&mut self.dirty));
        let mut regions = Vec::with_capacity(ranges.len());
        for range in &ranges {
            let bytes = &self.contents[range.start as usize..range.end as usize];
            self.device.write_buffer(staging, range.start, bytes)?;
            regions.push(vk::BufferCopy {
                src_offset: range.start,
                dst_offset: range.start,
                size: range.end - range.start,
            });
        }

        self.device.cmd_copy_buffer(cb, staging, self.buffer, &regions);
        let (dst_stage, dst_access) = consumer_scope(self.usage);
        self.device.cmd_buffer_barrier(
            cb,
            &BufferBarrier {
                buffer: self.buffer,
                offset: 0,
                size: vk::WHOLE_SIZE,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_stage,
                dst_access,
            },
        );
        Ok(true)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            self.device.destroy_buffer(staging);
        }
        self.device.destroy_buffer(self.buffer);
    }
}

/// Merge overlapping or touching ranges.
fn coalesce(mut ranges: Vec<Range<u64>>) -> Vec<Range<u64>> {
    ranges.sort_unstable_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Stages and accesses that read a buffer with the given usage.
fn consumer_scope(usage: vk::BufferUsageFlags) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::empty();
    let mut access = vk::AccessFlags::empty();
    if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
        access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
        access |= vk::AccessFlags::INDEX_READ;
    }
    let shader_stages = vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER;
    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        stages |= shader_stages;
        access |= vk::AccessFlags::UNIFORM_READ;
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        stages |= shader_stages;
        access |= vk::AccessFlags::SHADER_READ;
    }
    if stages.is_empty() {
        (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ,
        )
    } else {
        (stages, access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{QueueKind, QueueSubmit};
    use crate::mock::{MockCommand, MockDevice};

    fn desc(location: MemoryLocation) -> GpuBufferDesc<'static> {
        GpuBufferDesc {
            name: "Test",
            level: 4,
            min_block_size: 64,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            location,
        }
    }

    #[test]
    fn host_visible_round_trip() {
        let device = Arc::new(MockDevice::new());
        let mut buffer =
            GpuBuffer::initialise_storage(device, &desc(MemoryLocation::CpuToGpu)).unwrap();
        let offset = buffer.allocate(100).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        buffer.upload(offset, &data).unwrap();

        let mut out = vec![0u8; 100];
        buffer.download(offset, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(buffer.pending_ranges(), 0);
    }

    #[test]
    fn lock_unlock_writes_through() {
        let device = Arc::new(MockDevice::new());
        let mut buffer =
            GpuBuffer::initialise_storage(device.clone(), &desc(MemoryLocation::CpuToGpu))
                .unwrap();
        let offset = buffer.allocate(64).unwrap();
        buffer.lock(offset, 4).unwrap().copy_from_slice(&[9, 8, 7, 6]);
        buffer.unlock(offset, 4).unwrap();

        let contents = device.buffer_contents(buffer.buffer()).unwrap();
        assert_eq!(&contents[offset as usize..offset as usize + 4], &[9, 8, 7, 6]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let mut buffer =
            GpuBuffer::initialise_storage(device, &desc(MemoryLocation::CpuToGpu)).unwrap();
        assert!(buffer.lock(1000, 100).is_err());
        assert!(buffer.upload(u64::MAX, &[1]).is_err());
    }

    #[test]
    fn device_local_flushes_through_staging() {
        let device = Arc::new(MockDevice::new());
        let mut buffer =
            GpuBuffer::initialise_storage(device.clone(), &desc(MemoryLocation::GpuOnly))
                .unwrap();
        assert!(buffer.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));

        let a = buffer.allocate(64).unwrap();
        let b = buffer.allocate(64).unwrap();
        buffer.upload(a, &[1; 64]).unwrap();
        buffer.upload(b, &[2; 64]).unwrap();
        assert_eq!(buffer.pending_ranges(), 2);

        let mut out = [0u8; 4];
        assert!(buffer.download(a, &mut out).is_err());

        let cb = device.allocate_command_buffer(QueueKind::Transfer).unwrap();
        device
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        assert!(buffer.flush(cb).unwrap());
        assert!(!buffer.flush(cb).unwrap());
        device.end_command_buffer(cb).unwrap();

        let commands = device.recorded_commands(cb);
        match &commands[0] {
            MockCommand::CopyBuffer { regions, .. } => {
                // Adjacent ranges are merged into one copy.
                assert_eq!(regions.len(), 1);
                assert_eq!(regions[0].size, 128);
            }
            other => panic!("expected a copy, got {other:?}"),
        }
        assert!(matches!(commands[1], MockCommand::BufferBarrier(_)));

        device
            .submit(
                QueueKind::Transfer,
                &QueueSubmit {
                    command_buffers: &[cb],
                    ..Default::default()
                },
            )
            .unwrap();
        let contents = device.buffer_contents(buffer.buffer()).unwrap();
        assert_eq!(contents[a as usize], 1);
        assert_eq!(contents[b as usize + 63], 2);
    }

    #[test]
    fn drop_destroys_both_buffers() {
        let device = Arc::new(MockDevice::new());
        let buffer =
            GpuBuffer::initialise_storage(device.clone(), &desc(MemoryLocation::GpuOnly))
                .unwrap();
        assert_eq!(device.live_buffer_count(), 2);
        drop(buffer);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn creation_failure_surfaces() {
        let device = Arc::new(MockDevice::new());
        device.fail_next_buffer_creation();
        let result = GpuBuffer::initialise_storage(device.clone(), &desc(MemoryLocation::GpuOnly));
        assert!(matches!(result, Err(GpuError::DeviceOutOfMemory(_))));
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn coalesce_merges_overlaps() {
        let merged = coalesce(vec![10..20, 0..5, 5..8, 15..30, 40..41]);
        assert_eq!(merged, vec![0..8, 10..30, 40..41]);
    }
}
