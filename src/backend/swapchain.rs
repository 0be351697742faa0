// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Surface support is re-queried on every creation since the current extent
// follows the window. Out-of-date and suboptimal results are reported as
// outcomes for the frame scheduler; anything else is fatal.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;
use crate::frame::{AcquireOutcome, PresentOutcome};
use super::image::create_image_view;
use super::surface::{ImageSharing, SwapchainParams};
use super::VulkanDevice;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Create a swapchain for the device's surface.
    ///
    /// # Arguments
    /// * `framebuffer` - Window size in pixels, used when the surface lets us pick
    /// * `present_priority` - Present modes in order of preference
    pub fn new(
        device: Arc<VulkanDevice>,
        framebuffer: vk::Extent2D,
        present_priority: &[vk::PresentModeKHR],
    ) -> Result<Self> {
        let support = device.surface_support()?;
        let params = SwapchainParams::choose(&support, framebuffer, present_priority)?;

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            params.extent.width,
            params.extent.height,
            params.image_count,
            params.present_mode
        );

        let sharing = ImageSharing::between(device.graphics_queue_family, device.present_queue_family);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(params.image_count)
            .image_format(params.surface_format.format)
            .image_color_space(params.surface_format.color_space)
            .image_extent(params.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing.mode())
            .queue_family_indices(sharing.queue_families())
            .pre_transform(params.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(params.present_mode)
            .clipped(true);

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);
        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let mut chain = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: params.surface_format.format,
            extent: params.extent,
            device,
        };

        chain.images = unsafe { chain.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &chain.images {
            let view = create_image_view(
                &chain.device.device,
                image,
                chain.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            chain.image_views.push(view);
        }

        log::info!("Created swapchain with {} images", chain.images.len());

        Ok(chain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering, signalling `semaphore` when it is ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        acquire_outcome(result).context("Failed to acquire swapchain image")
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        present_outcome(result).context("Failed to present swapchain image")
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn acquire_outcome(result: VkResult<(u32, bool)>) -> Result<AcquireOutcome, vk::Result> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(e),
    }
}

fn present_outcome(result: VkResult<bool>) -> Result<PresentOutcome, vk::Result> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_results_map_to_outcomes() {
        assert_eq!(
            acquire_outcome(Ok((2, false))),
            Ok(AcquireOutcome::Ready {
                image_index: 2,
                suboptimal: false
            })
        );
        assert_eq!(
            acquire_outcome(Ok((0, true))),
            Ok(AcquireOutcome::Ready {
                image_index: 0,
                suboptimal: true
            })
        );
        assert_eq!(
            acquire_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(AcquireOutcome::OutOfDate)
        );
        assert_eq!(
            acquire_outcome(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
    }

    #[test]
    fn present_results_map_to_outcomes() {
        assert_eq!(present_outcome(Ok(false)), Ok(PresentOutcome::Presented));
        assert_eq!(present_outcome(Ok(true)), Ok(PresentOutcome::Suboptimal));
        assert_eq!(
            present_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(PresentOutcome::OutOfDate)
        );
        assert_eq!(
            present_outcome(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
    }
}
