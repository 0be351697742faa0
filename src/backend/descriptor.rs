// Descriptors - the uniform buffer and texture sampler bound at set 0
//
// binding 0: UniformBufferObject, vertex stage
// binding 1: combined image sampler, fragment stage

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::buffer::Buffer;
use super::image::Texture;
use super::VulkanDevice;

pub const UBO_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(UBO_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

/// Pool sizes for `set_count` sets of the layout above.
pub fn pool_sizes(set_count: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: set_count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: set_count,
        },
    ]
}

pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    device: Arc<VulkanDevice>,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let bindings = layout_bindings();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let handle = unsafe { device.device.create_descriptor_set_layout(&create_info, None) }
            .context("Failed to create descriptor set layout")?;

        Ok(Self { handle, device })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.handle, None)
        };
    }
}

/// One descriptor set per swapchain image, freed with the pool.
pub struct DescriptorSets {
    pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    device: Arc<VulkanDevice>,
}

impl DescriptorSets {
    /// Allocate a set for each uniform buffer and point it at that buffer
    /// plus the shared texture.
    pub fn new(
        device: Arc<VulkanDevice>,
        layout: &DescriptorSetLayout,
        uniform_buffers: &[Buffer],
        texture: &Texture,
    ) -> Result<Self> {
        let count = uniform_buffers.len() as u32;
        let sizes = pool_sizes(count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(count);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let mut sets = Self {
            pool,
            sets: Vec::new(),
            device,
        };

        let layouts = vec![layout.handle; uniform_buffers.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        sets.sets = unsafe { sets.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        for (&set, buffer) in sets.sets.iter().zip(uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.handle,
                offset: 0,
                range: buffer.size,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.image.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(UBO_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(SAMPLER_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];

            unsafe { sets.device.device.update_descriptor_sets(&writes, &[]) };
        }

        Ok(sets)
    }

    pub fn get(&self, index: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(index).copied()
    }
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        // Sets go with the pool
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_match_shader_interface() {
        let bindings = layout_bindings();
        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(bindings[0].stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(
            bindings[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(bindings[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn pool_holds_one_of_each_per_set() {
        let sizes = pool_sizes(3);
        assert!(sizes.iter().all(|size| size.descriptor_count == 3));
    }
}
