// Buffer utilities for vertex, index, and uniform buffers
//
// Each Buffer owns its memory allocation. Device-local buffers are filled
// through a host-visible staging buffer and a one-time copy command.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use super::commands::CommandPools;
use super::VulkanDevice;

const HOST_VISIBLE_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// GPU buffer plus its dedicated memory
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a buffer with specified usage and memory properties
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        // From here on Drop releases whatever has been created
        let mut buffer = Self {
            handle,
            memory: vk::DeviceMemory::null(),
            size,
            device,
        };

        let mem_requirements = unsafe {
            buffer.device.device.get_buffer_memory_requirements(handle)
        };
        let memory_type_index = buffer
            .device
            .find_memory_type(mem_requirements.memory_type_bits, memory_properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        buffer.memory = unsafe { buffer.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        unsafe {
            buffer
                .device
                .device
                .bind_buffer_memory(handle, buffer.memory, 0)
                .context("Failed to bind buffer memory")?;
        }

        Ok(buffer)
    }

    /// Host-visible, coherent buffer sized for `data` and filled with it.
    pub fn staging<T: Pod>(device: Arc<VulkanDevice>, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_VISIBLE_COHERENT,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Device-local buffer filled from `data` via a staging copy.
    pub fn device_local_with_data<T: Pod>(
        device: Arc<VulkanDevice>,
        commands: &CommandPools,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let staging = Self::staging(device.clone(), data)?;

        let buffer = Self::new(
            device,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        commands.one_time_submit(|device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: staging.size,
            };
            unsafe { device.cmd_copy_buffer(cmd, staging.handle, buffer.handle, &[region]) };
            Ok(())
        })?;

        Ok(buffer)
    }

    /// One host-visible uniform buffer holding a single `T`.
    pub fn uniform<T: Pod>(device: Arc<VulkanDevice>) -> Result<Self> {
        Self::new(
            device,
            std::mem::size_of::<T>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            HOST_VISIBLE_COHERENT,
        )
    }

    /// Map, copy `data` to offset 0, unmap. The memory must be host visible.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes overflows buffer of {} bytes",
            bytes.len(),
            self.size
        );

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;

            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.handle, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}
