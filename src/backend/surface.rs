// Surface support - What the window surface can do on a given GPU
//
// Queried once per adapter during selection and again on every swapchain
// rebuild, since capabilities (current extent in particular) change with
// the window. The choose_* functions are pure policy over the query result.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use thiserror::Error;

/// Preferred surface format: 8-bit BGRA in sRGB, sRGB non-linear color space.
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("Surface reports no supported formats")]
    NoFormats,
    #[error("Surface reports no supported present modes")]
    NoPresentModes,
}

/// Snapshot of surface support for one physical device.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        loader: &khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query surface present modes")?,
            })
        }
    }

    /// A device whose surface offers no formats or no present modes is unusable.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Everything the swapchain create info needs, decided from a support query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainParams {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainParams {
    pub fn choose(
        support: &SurfaceSupport,
        framebuffer: vk::Extent2D,
        present_priority: &[vk::PresentModeKHR],
    ) -> Result<Self, SurfaceError> {
        let surface_format = choose_surface_format(&support.formats, PREFERRED_SURFACE_FORMAT)
            .ok_or(SurfaceError::NoFormats)?;
        let present_mode = choose_present_mode(&support.present_modes, present_priority)
            .ok_or(SurfaceError::NoPresentModes)?;

        Ok(Self {
            surface_format,
            present_mode,
            extent: choose_extent(&support.capabilities, framebuffer),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// Pick the format closest to `preferred`.
///
/// An exact match on format and color space wins outright; otherwise the
/// first format matching either field; otherwise the first format offered.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    let mut best: Option<(u32, vk::SurfaceFormatKHR)> = None;

    for &candidate in formats {
        let score = u32::from(candidate.format == preferred.format)
            + u32::from(candidate.color_space == preferred.color_space);
        if score == 2 {
            return Some(candidate);
        }
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, candidate));
        }
    }

    best.map(|(_, format)| format)
}

/// First mode in `priority` that the surface supports, else the first
/// supported mode.
pub fn choose_present_mode(
    supported: &[vk::PresentModeKHR],
    priority: &[vk::PresentModeKHR],
) -> Option<vk::PresentModeKHR> {
    priority
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .or_else(|| supported.first().copied())
}

/// The surface's current extent, unless it reports the "window decides"
/// sentinel, in which case the framebuffer size clamped to the allowed range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: framebuffer.width.clamp(min.width, max.width),
        height: framebuffer.height.clamp(min.height, max.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

/// How swapchain images are shared between the graphics and present queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl ImageSharing {
    pub fn between(graphics_family: u32, present_family: u32) -> Self {
        if graphics_family == present_family {
            ImageSharing::Exclusive
        } else {
            ImageSharing::Concurrent([graphics_family, present_family])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            ImageSharing::Exclusive => vk::SharingMode::EXCLUSIVE,
            ImageSharing::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn queue_families(&self) -> &[u32] {
        match self {
            ImageSharing::Exclusive => &[],
            ImageSharing::Concurrent(families) => families,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
        images: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: images.0,
            max_image_count: images.1,
            ..Default::default()
        }
    }

    #[test]
    fn exact_format_match_wins() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            PREFERRED_SURFACE_FORMAT,
        ];
        assert_eq!(
            choose_surface_format(&formats, PREFERRED_SURFACE_FORMAT),
            Some(PREFERRED_SURFACE_FORMAT)
        );
    }

    #[test]
    fn partial_format_match_beats_no_match() {
        let partial = format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let formats = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            partial,
        ];
        assert_eq!(choose_surface_format(&formats, PREFERRED_SURFACE_FORMAT), Some(partial));
    }

    #[test]
    fn format_ties_keep_the_first() {
        let first = format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT);
        let second = format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(
            choose_surface_format(&[first, second], PREFERRED_SURFACE_FORMAT),
            Some(first)
        );

        let none_a = format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::HDR10_ST2084_EXT);
        let none_b = format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::HDR10_ST2084_EXT);
        assert_eq!(
            choose_surface_format(&[none_a, none_b], PREFERRED_SURFACE_FORMAT),
            Some(none_a)
        );
    }

    #[test]
    fn no_formats_means_no_choice() {
        assert_eq!(choose_surface_format(&[], PREFERRED_SURFACE_FORMAT), None);
    }

    #[test]
    fn present_mode_follows_priority() {
        let priority = [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        let supported = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&supported, &priority),
            Some(vk::PresentModeKHR::FIFO)
        );

        let supported = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&supported, &priority),
            Some(vk::PresentModeKHR::MAILBOX)
        );
    }

    #[test]
    fn present_mode_falls_back_to_first_supported() {
        let supported = [vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&supported, &[vk::PresentModeKHR::MAILBOX]),
            Some(vk::PresentModeKHR::FIFO_RELAXED)
        );
        assert_eq!(choose_present_mode(&[], &[vk::PresentModeKHR::FIFO]), None);
    }

    #[test]
    fn fixed_current_extent_is_used_as_is() {
        let capabilities = caps((1024, 768), (1, 1), (4096, 4096), (2, 3));
        let extent = choose_extent(&capabilities, vk::Extent2D { width: 10, height: 10 });
        assert_eq!(extent, vk::Extent2D { width: 1024, height: 768 });
    }

    #[test]
    fn sentinel_extent_clamps_framebuffer() {
        let capabilities = caps((u32::MAX, u32::MAX), (100, 100), (1920, 1080), (2, 3));

        let big = choose_extent(&capabilities, vk::Extent2D { width: 5000, height: 50 });
        assert_eq!(big, vk::Extent2D { width: 1920, height: 100 });

        let fits = choose_extent(&capabilities, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(fits, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn image_count_is_min_plus_one_within_bounds() {
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (2, 0))), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (2, 8))), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (3, 3))), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (1, 1))), 1);
    }

    #[test]
    fn sharing_is_concurrent_only_across_families() {
        assert_eq!(ImageSharing::between(0, 0), ImageSharing::Exclusive);
        assert!(ImageSharing::between(0, 0).queue_families().is_empty());

        let split = ImageSharing::between(0, 2);
        assert_eq!(split.mode(), vk::SharingMode::CONCURRENT);
        assert_eq!(split.queue_families(), &[0, 2]);
    }

    #[test]
    fn params_require_formats_and_modes() {
        let extent = vk::Extent2D { width: 800, height: 600 };
        let mut support = SurfaceSupport {
            capabilities: caps((800, 600), (1, 1), (4096, 4096), (2, 0)),
            formats: vec![],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(!support.is_adequate());
        assert_eq!(
            SwapchainParams::choose(&support, extent, &[]),
            Err(SurfaceError::NoFormats)
        );

        support.formats.push(PREFERRED_SURFACE_FORMAT);
        support.present_modes.clear();
        assert_eq!(
            SwapchainParams::choose(&support, extent, &[]),
            Err(SurfaceError::NoPresentModes)
        );

        support.present_modes.push(vk::PresentModeKHR::FIFO);
        let params = SwapchainParams::choose(&support, extent, &[vk::PresentModeKHR::MAILBOX])
            .unwrap();
        assert_eq!(params.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(params.image_count, 3);
        assert_eq!(params.extent, extent);
    }
}
