// Command pools and one-shot command submission
//
// Two pools on the graphics family: a persistent one for the per-image draw
// command buffers, and a transient one for short-lived upload and layout
// transition work.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

pub struct CommandPools {
    pub persistent: vk::CommandPool,
    pub transient: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPools {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let persistent_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family);
        let transient_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let persistent = unsafe { device.device.create_command_pool(&persistent_info, None) }
            .context("Failed to create command pool")?;
        let transient = match unsafe { device.device.create_command_pool(&transient_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(persistent, None) };
                return Err(e).context("Failed to create transient command pool");
            }
        };

        Ok(Self {
            persistent,
            transient,
            device,
        })
    }

    /// Allocate `count` primary buffers from the persistent pool.
    pub fn allocate(&self, count: usize) -> Result<CommandBuffers> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.persistent)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(CommandBuffers {
            pool: self.persistent,
            buffers,
            device: self.device.clone(),
        })
    }

    /// Record `record` into a fresh transient buffer, submit it to the
    /// graphics queue and wait for it to finish.
    pub fn one_time_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.transient)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate one-time command buffer")?;

        let result = self.record_and_wait(buffers[0], record);

        unsafe { device.free_command_buffers(self.transient, &buffers) };
        result
    }

    fn record_and_wait<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin one-time command buffer")?;

        record(device, cmd)?;

        unsafe { device.end_command_buffer(cmd) }
            .context("Failed to end one-time command buffer")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        unsafe {
            device
                .queue_submit(
                    self.device.graphics_queue,
                    std::slice::from_ref(&submit_info),
                    vk::Fence::null(),
                )
                .context("Failed to submit one-time command buffer")?;
            device
                .queue_wait_idle(self.device.graphics_queue)
                .context("Failed to wait for graphics queue")?;
        }
        Ok(())
    }
}

impl Drop for CommandPools {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.transient, None);
            self.device.device.destroy_command_pool(self.persistent, None);
        }
    }
}

/// Command buffers owned by one swapchain generation, freed with it.
pub struct CommandBuffers {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    device: Arc<VulkanDevice>,
}

impl CommandBuffers {
    pub fn get(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.buffers.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = vk::CommandBuffer> + '_ {
        self.buffers.iter().copied()
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            unsafe { self.device.device.free_command_buffers(self.pool, &self.buffers) };
        }
    }
}
