//! The device abstraction every renderer component records against.
//!
//! [`Device`] exposes the subset of Vulkan the renderer needs as safe methods
//! over raw `ash` handles. [`crate::vulkan::VulkanDevice`] implements it on a
//! real GPU; with the `mock` feature, [`crate::mock::MockDevice`] implements it
//! in host memory so pass ordering and pooling can be tested without one.

use crate::error::Result;
use crate::pipeline::{GraphicsPipelineConfig, Pipeline};
use crate::sync::SemaphoreWait;
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Queue a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueKind {
    #[default]
    Graphics,
    Compute,
    Transfer,
}

/// Device limits the pools and passes depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
    pub max_image_dimension_2d: u32,
    pub max_image_dimension_3d: u32,
    pub supports_geometry_shader: bool,
    pub supports_conservative_rasterization: bool,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            non_coherent_atom_size: 64,
            max_image_dimension_2d: 16384,
            max_image_dimension_3d: 2048,
            supports_geometry_shader: true,
            supports_conservative_rasterization: false,
        }
    }
}

/// Parameters of a buffer creation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// Parameters of an image creation.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl<'a> ImageDesc<'a> {
    /// A single-layer 2D image with one mip level.
    pub fn new_2d(name: &'a str, format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            name,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
            flags: vk::ImageCreateFlags::empty(),
        }
    }

    /// A six-layer cube-compatible image.
    pub fn new_cube(name: &'a str, format: vk::Format, size: u32) -> Self {
        Self {
            array_layers: 6,
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ..Self::new_2d(name, format, size, size)
        }
    }

    /// A 3D image, cubic in extent.
    pub fn new_3d(name: &'a str, format: vk::Format, size: u32) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_3D,
            extent: vk::Extent3D {
                width: size,
                height: size,
                depth: size,
            },
            ..Self::new_2d(name, format, size, size)
        }
    }

    pub const fn mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    pub const fn array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }
}

/// Parameters of an image view creation.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: vk::ImageSubresourceRange,
}

/// Parameters of a sampler creation.
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A descriptor update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorWrite {
    UniformBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageImage {
        binding: u32,
        view: vk::ImageView,
    },
    SampledImage {
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
}

impl DescriptorWrite {
    pub const fn binding(&self) -> u32 {
        match *self {
            Self::UniformBuffer { binding, .. }
            | Self::StorageBuffer { binding, .. }
            | Self::StorageImage { binding, .. }
            | Self::SampledImage { binding, .. } => binding,
        }
    }
}

/// A buffer memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// An image layout transition.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// A colour attachment of a dynamic rendering scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub view: vk::ImageView,
    /// Clear colour, `None` to load the previous contents.
    pub clear: Option<[f32; 4]>,
}

/// A depth attachment of a dynamic rendering scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub view: vk::ImageView,
    pub clear: Option<f32>,
}

/// A dynamic rendering scope.
#[derive(Debug, Clone, Copy)]
pub struct RenderingDesc<'a> {
    pub area: vk::Rect2D,
    pub layer_count: u32,
    pub color: &'a [ColorAttachment],
    pub depth: Option<DepthAttachment>,
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait: &'a [SemaphoreWait],
    pub signal: &'a [vk::Semaphore],
    pub fence: Option<vk::Fence>,
}

/// A graphics device.
///
/// Objects are addressed by raw Vulkan handles; callers own them and destroy
/// them through the matching `destroy_*` method. Recording methods (`cmd_*`)
/// are only valid between [`Device::begin_command_buffer`] and
/// [`Device::end_command_buffer`].
pub trait Device: Send + Sync {
    fn limits(&self) -> DeviceLimits;

    // Buffers

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Copy `data` into a host-visible buffer.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    /// Copy from a host-visible buffer into `out`.
    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> Result<()>;

    // Images

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet)
        -> Result<()>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // Pipelines

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline>;
    fn create_compute_pipeline(
        &self,
        shader: &[u32],
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline>;
    fn destroy_pipeline(&self, pipeline: &Pipeline);

    // Synchronisation

    fn create_semaphore(&self, name: &str) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn is_fence_signaled(&self, fence: vk::Fence) -> Result<bool>;

    // Command buffers

    fn allocate_command_buffer(&self, queue: QueueKind) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, queue: QueueKind, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    // Recording

    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_fill_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    );
    fn cmd_buffer_barrier(&self, cb: vk::CommandBuffer, barrier: &BufferBarrier);
    fn cmd_image_barrier(&self, cb: vk::CommandBuffer, barrier: &ImageBarrier);
    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, desc: &RenderingDesc<'_>);
    fn cmd_end_rendering(&self, cb: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: &Pipeline);
    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &Pipeline,
        index: u32,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &Pipeline,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    );
    fn cmd_bind_vertex_buffer(
        &self,
        cb: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    );
    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32);
    /// Blit from `src` in `TRANSFER_SRC_OPTIMAL` to `dst` in `TRANSFER_DST_OPTIMAL`.
    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    );
    /// Clear an image in `TRANSFER_DST_OPTIMAL`.
    fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    );

    // Queues

    fn submit(&self, queue: QueueKind, submit: &QueueSubmit<'_>) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}

/// Full colour subresource range of an image.
pub const fn color_range(mip_levels: u32, array_layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count: array_layers,
    }
}
