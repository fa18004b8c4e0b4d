//! Descriptor set management.

use crate::device::{DescriptorBinding, DescriptorWrite, Device};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            ty,
            count,
            stages,
        });
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stages)
    }

    /// Add `count` combined image samplers at one binding.
    pub fn sampled_images(self, binding: u32, count: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stages,
        )
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    pub fn build(self, device: Arc<dyn Device>) -> Result<DescriptorSetLayout> {
        let layout = device.create_descriptor_set_layout(&self.bindings)?;
        Ok(DescriptorSetLayout {
            device,
            layout,
            bindings: self.bindings,
        })
    }
}

/// An owned descriptor set layout.
pub struct DescriptorSetLayout {
    device: Arc<dyn Device>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Pool sizes able to hold `max_sets` sets of this layout.
    pub fn pool_sizes(&self, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.count * max_sets;
            match sizes.iter_mut().find(|size| size.ty == binding.ty) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.ty,
                    descriptor_count: count,
                }),
            }
        }
        sizes
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
    }
}

/// Descriptor pool for allocating descriptor sets of one layout.
pub struct DescriptorPool {
    device: Arc<dyn Device>,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    max_sets: u32,
    live_sets: u32,
}

impl DescriptorPool {
    /// Create a pool sized for `max_sets` sets of `layout`.
    pub fn new(device: Arc<dyn Device>, layout: &DescriptorSetLayout, max_sets: u32) -> Result<Self> {
        let pool = device.create_descriptor_pool(max_sets, &layout.pool_sizes(max_sets))?;
        Ok(Self {
            device,
            pool,
            layout: layout.handle(),
            max_sets,
            live_sets: 0,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn live_sets(&self) -> u32 {
        self.live_sets
    }

    /// Whether another set can be allocated.
    pub fn has_room(&self) -> bool {
        self.live_sets < self.max_sets
    }

    /// Allocate a set and fill it with `writes`.
    pub fn allocate(&mut self, writes: &[DescriptorWrite]) -> Result<vk::DescriptorSet> {
        let set = self.device.allocate_descriptor_set(self.pool, self.layout)?;
        if !writes.is_empty() {
            self.device.update_descriptor_set(set, writes);
        }
        self.live_sets += 1;
        Ok(set)
    }

    /// Return a set to the pool.
    pub fn free(&mut self, set: vk::DescriptorSet) -> Result<()> {
        self.device.free_descriptor_set(self.pool, set)?;
        self.live_sets = self.live_sets.saturating_sub(1);
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn layout(device: Arc<MockDevice>) -> DescriptorSetLayout {
        DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .uniform_buffer(1, vk::ShaderStageFlags::FRAGMENT)
            .sampled_images(2, 3, vk::ShaderStageFlags::FRAGMENT)
            .build(device)
            .unwrap()
    }

    #[test]
    fn pool_sizes_merge_types() {
        let device = Arc::new(MockDevice::new());
        let layout = layout(device);
        let sizes = layout.pool_sizes(10);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 20);
        assert_eq!(sizes[1].descriptor_count, 30);
    }

    #[test]
    fn allocate_writes_and_frees() {
        let device = Arc::new(MockDevice::new());
        let layout = layout(device.clone());
        let mut pool = DescriptorPool::new(device.clone(), &layout, 2).unwrap();

        let write = DescriptorWrite::UniformBuffer {
            binding: 0,
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 64,
        };
        let set = pool.allocate(&[write]).unwrap();
        assert_eq!(device.descriptor_writes(set), vec![write]);
        assert!(pool.has_room());
        let _second = pool.allocate(&[]).unwrap();
        assert!(!pool.has_room());

        pool.free(set).unwrap();
        assert_eq!(pool.live_sets(), 1);
        drop(pool);
        assert_eq!(device.live_descriptor_set_count(), 0);
    }
}
