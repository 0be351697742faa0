// Synchronization primitives
//
// One FrameSlot per frame in flight. The fence starts signaled so the very
// first wait on a slot returns immediately.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSlot {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        // Build up incrementally so a failure part way releases what exists
        let mut slot = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            device,
        };
        unsafe {
            slot.image_available = slot
                .device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            slot.render_finished = slot
                .device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            slot.in_flight = slot
                .device
                .device
                .create_fence(&fence_info, None)
                .context("Failed to create fence")?;
        }
        Ok(slot)
    }

    pub fn create_all(device: &Arc<VulkanDevice>, count: usize) -> Result<Vec<Self>> {
        (0..count).map(|_| Self::new(device.clone())).collect()
    }

    /// Block until the GPU has finished the last submission made from this slot.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight], true, u64::MAX)
        }
        .context("Failed to wait for frame fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight]) }
            .context("Failed to reset frame fence")
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            // Destroying null handles is a no-op
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight, None);
        }
    }
}
