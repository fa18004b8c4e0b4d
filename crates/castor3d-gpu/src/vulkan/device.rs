//! [`Device`] implementation over a real Vulkan device.

use super::capabilities::{GpuCapabilities, CONSERVATIVE_RASTERIZATION};
use super::instance::{create_instance, select_physical_device};
use super::pipeline::{create_compute_pipeline, create_graphics_pipeline};
use crate::device::{
    BufferBarrier, BufferDesc, DescriptorBinding, DescriptorWrite, Device, DeviceLimits,
    ImageBarrier, ImageDesc, ImageViewDesc, QueueKind, QueueSubmit, RenderingDesc, SamplerDesc,
};
use crate::error::{GpuError, Result};
use crate::pipeline::{GraphicsPipelineConfig, Pipeline};
use crate::sync::split_waits;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::CStr;

/// Memory backing live buffers and images.
struct Allocations {
    allocator: Option<Allocator>,
    buffers: HashMap<vk::Buffer, Allocation>,
    images: HashMap<vk::Image, Allocation>,
}

impl Allocations {
    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    fn free(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(err) = allocator.free(allocation) {
                tracing::warn!("Failed to free allocation: {err}");
            }
        }
    }
}

struct QueueSlot {
    family: u32,
    queue: vk::Queue,
    /// Command pools are externally synchronised.
    pool: Mutex<vk::CommandPool>,
}

/// A Vulkan 1.3 device drawing offscreen.
pub struct VulkanDevice {
    // Keeps the loader alive for the lifetime of the instance.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    conservative_rasterization: bool,
    allocations: Mutex<Allocations>,
    graphics: QueueSlot,
    compute: QueueSlot,
    transfer: QueueSlot,
    /// Queues may alias when families are shared.
    submit_lock: Mutex<()>,
}

impl VulkanDevice {
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Queue family index used for `queue`.
    pub fn queue_family(&self, queue: QueueKind) -> u32 {
        self.slot(queue).family
    }

    fn slot(&self, queue: QueueKind) -> &QueueSlot {
        match queue {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Compute => &self.compute,
            QueueKind::Transfer => &self.transfer,
        }
    }

    fn with_mapped<R>(
        &self,
        buffer: vk::Buffer,
        offset: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer is not host visible".to_string()))?;
        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState(format!("Offset {offset} out of range")))?;
        let range = mapped
            .get_mut(start..start.saturating_add(len))
            .ok_or_else(|| {
                GpuError::InvalidState(format!("Range {start}+{len} exceeds buffer bounds"))
            })?;
        Ok(f(range))
    }
}

impl Device for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            supports_conservative_rasterization: self.conservative_rasterization,
            ..self.capabilities.device_limits()
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut allocations = self.allocations.lock();
        let allocation = match allocations.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: desc.location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            allocations.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(err.into());
        }

        allocations.buffers.insert(buffer, allocation);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut allocations = self.allocations.lock();
        if let Some(allocation) = allocations.buffers.remove(&buffer) {
            allocations.free(allocation);
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.with_mapped(buffer, offset, data.len(), |dst| dst.copy_from_slice(data))
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        self.with_mapped(buffer, offset, len, |src| out.copy_from_slice(src))
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        let create_info = vk::ImageCreateInfo::default()
            .flags(desc.flags)
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let mut allocations = self.allocations.lock();
        let allocation = match allocations.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            allocations.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(err.into());
        }

        allocations.images.insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut allocations = self.allocations.lock();
        if let Some(allocation) = allocations.images.remove(&image) {
            allocations.free(allocation);
        }
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(desc.range);
        Ok(unsafe { self.device.create_image_view(&info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .max_lod(desc.max_lod);
        Ok(unsafe { self.device.create_sampler(&info, None) }?)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None) }?)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None) }?)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No descriptor set allocated".to_string()))
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        unsafe { self.device.free_descriptor_sets(pool, &[set]) }?;
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        for write in writes {
            match *write {
                DescriptorWrite::UniformBuffer {
                    binding,
                    buffer,
                    offset,
                    range,
                }
                | DescriptorWrite::StorageBuffer {
                    binding,
                    buffer,
                    offset,
                    range,
                } => {
                    let ty = if matches!(write, DescriptorWrite::UniformBuffer { .. }) {
                        vk::DescriptorType::UNIFORM_BUFFER
                    } else {
                        vk::DescriptorType::STORAGE_BUFFER
                    };
                    let info = [vk::DescriptorBufferInfo {
                        buffer,
                        offset,
                        range,
                    }];
                    let vk_write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(ty)
                        .buffer_info(&info);
                    unsafe { self.device.update_descriptor_sets(&[vk_write], &[]) };
                }
                DescriptorWrite::StorageImage { binding, view } => {
                    let info = [vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: vk::ImageLayout::GENERAL,
                    }];
                    let vk_write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .image_info(&info);
                    unsafe { self.device.update_descriptor_sets(&[vk_write], &[]) };
                }
                DescriptorWrite::SampledImage {
                    binding,
                    array_element,
                    view,
                    sampler,
                } => {
                    let info = [vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }];
                    let vk_write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .dst_array_element(array_element)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&info);
                    unsafe { self.device.update_descriptor_sets(&[vk_write], &[]) };
                }
            }
        }
    }

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline> {
        if config.conservative_rasterization && !self.conservative_rasterization {
            return Err(GpuError::PipelineCreation(
                "Conservative rasterization is not enabled on this device".to_string(),
            ));
        }
        unsafe { create_graphics_pipeline(&self.device, config, set_layouts, push_constants) }
    }

    fn create_compute_pipeline(
        &self,
        shader: &[u32],
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline> {
        unsafe { create_compute_pipeline(&self.device, shader, set_layouts, push_constants) }
    }

    fn destroy_pipeline(&self, pipeline: &Pipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    fn create_semaphore(&self, name: &str) -> Result<vk::Semaphore> {
        let semaphore =
            unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?;
        tracing::trace!(name, ?semaphore, "Created semaphore");
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None) }?)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }?;
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn is_fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence) }?)
    }

    fn allocate_command_buffer(&self, queue: QueueKind) -> Result<vk::CommandBuffer> {
        let pool = self.slot(queue).pool.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))
    }

    fn free_command_buffer(&self, queue: QueueKind, command_buffer: vk::CommandBuffer) {
        let pool = self.slot(queue).pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[command_buffer]) };
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }?;
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }?;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cb, src, dst, regions) };
    }

    fn cmd_fill_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        unsafe { self.device.cmd_fill_buffer(cb, buffer, offset, size, data) };
    }

    fn cmd_buffer_barrier(&self, cb: vk::CommandBuffer, barrier: &BufferBarrier) {
        let vk_barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(barrier.buffer)
            .offset(barrier.offset)
            .size(barrier.size);
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[vk_barrier],
                &[],
            );
        }
    }

    fn cmd_image_barrier(&self, cb: vk::CommandBuffer, barrier: &ImageBarrier) {
        let vk_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(barrier.range);
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[vk_barrier],
            );
        }
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, desc: &RenderingDesc<'_>) {
        let color: Vec<vk::RenderingAttachmentInfo> = desc
            .color
            .iter()
            .map(|attachment| {
                let info = vk::RenderingAttachmentInfo::default()
                    .image_view(attachment.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .store_op(vk::AttachmentStoreOp::STORE);
                match attachment.clear {
                    Some(float32) => info
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .clear_value(vk::ClearValue {
                            color: vk::ClearColorValue { float32 },
                        }),
                    None => info.load_op(vk::AttachmentLoadOp::LOAD),
                }
            })
            .collect();

        let depth = desc.depth.map(|attachment| {
            let info = vk::RenderingAttachmentInfo::default()
                .image_view(attachment.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .store_op(vk::AttachmentStoreOp::STORE);
            match attachment.clear {
                Some(depth) => info
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                    }),
                None => info.load_op(vk::AttachmentLoadOp::LOAD),
            }
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(desc.area)
            .layer_count(desc.layer_count)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(cb, &rendering_info) };
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cb) };
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: &Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cb, pipeline.bind_point, pipeline.pipeline);
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &Pipeline,
        index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cb,
                pipeline.bind_point,
                pipeline.layout,
                index,
                &[set],
                &[],
            );
        }
    }

    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &Pipeline,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(cb, pipeline.layout, stages, 0, data);
        }
    }

    fn cmd_bind_vertex_buffer(
        &self,
        cb: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cb, binding, &[buffer], &[offset]);
        }
    }

    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cb, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cb, 0, &[scissor]) };
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw(cb, vertex_count, instance_count, 0, 0) };
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cb, x, y, z) };
    }

    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    ) {
        unsafe {
            self.device.cmd_blit_image(
                cb,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(region),
                filter,
            );
        }
    }

    fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    ) {
        unsafe {
            self.device.cmd_clear_color_image(
                cb,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                &[range],
            );
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit(&self, queue: QueueKind, submit: &QueueSubmit<'_>) -> Result<()> {
        let (wait_semaphores, wait_stages) = split_waits(submit.wait);
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal);
        let _guard = self.submit_lock.lock();
        unsafe {
            self.device.queue_submit(
                self.slot(queue).queue,
                &[info],
                submit.fence.unwrap_or_else(vk::Fence::null),
            )
        }?;
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for slot in [&self.graphics, &self.compute, &self.transfer] {
                self.device.destroy_command_pool(*slot.pool.lock(), None);
            }

            // Free all VkDeviceMemory before the device goes away.
            let mut allocations = self.allocations.lock();
            let leaked = allocations.buffers.len() + allocations.images.len();
            if leaked > 0 {
                tracing::warn!(leaked, "Destroying device with live resources");
            }
            let buffers: Vec<_> = allocations.buffers.drain().collect();
            for (buffer, allocation) in buffers {
                allocations.free(allocation);
                self.device.destroy_buffer(buffer, None);
            }
            let images: Vec<_> = allocations.images.drain().collect();
            for (image, allocation) in images {
                allocations.free(allocation);
                self.device.destroy_image(image, None);
            }
            allocations.allocator = None;
            drop(allocations);

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for a [`VulkanDevice`].
pub struct VulkanDeviceBuilder {
    app_name: String,
    enable_validation: bool,
    enable_conservative_rasterization: bool,
}

impl Default for VulkanDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Castor3D".to_string(),
            enable_validation: cfg!(debug_assertions),
            enable_conservative_rasterization: true,
        }
    }
}

impl VulkanDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Request conservative rasterization when the device offers it.
    pub fn conservative_rasterization(mut self, enable: bool) -> Self {
        self.enable_conservative_rasterization = enable;
        self
    }

    /// Load Vulkan, pick a device and create queues, pools and the allocator.
    pub fn build(self) -> Result<VulkanDevice> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        match unsafe { self.build_on(entry, instance.clone()) } {
            Ok(device) => Ok(device),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    unsafe fn build_on(self, entry: ash::Entry, instance: ash::Instance) -> Result<VulkanDevice> {
        let physical_device = unsafe { select_physical_device(&instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let conservative_rasterization = self.enable_conservative_rasterization
            && capabilities.supports_conservative_rasterization();
        if self.enable_conservative_rasterization && !conservative_rasterization {
            tracing::warn!("{CONSERVATIVE_RASTERIZATION} unavailable, voxelization may miss thin geometry");
        }

        let families = unsafe { find_queue_families(&instance, physical_device) }?;
        let device = unsafe {
            create_device(
                &instance,
                physical_device,
                &families,
                capabilities.supports_geometry_shader,
                conservative_rasterization,
            )
        }?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()));
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        let mut pools = Vec::with_capacity(3);
        for family in [families.graphics, families.compute, families.transfer] {
            let info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(family);
            match unsafe { device.create_command_pool(&info, None) } {
                Ok(pool) => pools.push(pool),
                Err(err) => {
                    for pool in pools {
                        unsafe { device.destroy_command_pool(pool, None) };
                    }
                    drop(allocator);
                    unsafe { device.destroy_device(None) };
                    return Err(err.into());
                }
            }
        }

        let slot = |family: u32, pool: vk::CommandPool| QueueSlot {
            family,
            queue: unsafe { device.get_device_queue(family, 0) },
            pool: Mutex::new(pool),
        };
        let graphics = slot(families.graphics, pools[0]);
        let compute = slot(families.compute, pools[1]);
        let transfer = slot(families.transfer, pools[2]);

        Ok(VulkanDevice {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            conservative_rasterization,
            allocations: Mutex::new(Allocations {
                allocator: Some(allocator),
                buffers: HashMap::new(),
                images: HashMap::new(),
            }),
            graphics,
            compute,
            transfer,
            submit_lock: Mutex::new(()),
        })
    }
}

struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Find queue families for graphics, compute and transfer, preferring
/// dedicated families.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, family) in (0u32..).zip(queue_families.iter()) {
        let flags = family.queue_flags;
        if flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        if flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

/// Create the logical device.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilyIndices,
    geometry_shader: bool,
    conservative_rasterization: bool,
) -> Result<ash::Device> {
    let unique_families: BTreeSet<u32> = [families.graphics, families.compute, families.transfer]
        .into_iter()
        .collect();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut extensions: Vec<&CStr> = Vec::new();
    if conservative_rasterization {
        extensions.push(ash::ext::conservative_rasterization::NAME);
    }
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .geometry_shader(geometry_shader)
        .fragment_stores_and_atomics(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }?;
    Ok(device)
}
