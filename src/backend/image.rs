// Images - attachments, textures and samplers
//
// Image owns image + memory + view. Attachments (depth, multisampled color)
// belong to a swapchain generation; the texture lives for the whole run.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use super::buffer::Buffer;
use super::commands::CommandPools;
use super::VulkanDevice;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("Unsupported layout transition from {from:?} to {to:?}")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    #[error("Failed to find supported format")]
    NoSupportedFormat,
    #[error("Texture image format {0:?} does not support linear blitting")]
    NoLinearBlit(vk::Format),
}

/// Number of levels in a full mip chain for a `width` x `height` image.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    format == vk::Format::D32_SFLOAT_S8_UINT || format == vk::Format::D24_UNORM_S8_UINT
}

/// First candidate whose `tiling` features include `features`.
///
/// `properties` reports the format properties of a candidate.
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut properties: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format, ImageError> {
    candidates
        .iter()
        .copied()
        .find(|&format| {
            let props = properties(format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                _ => false,
            }
        })
        .ok_or(ImageError::NoSupportedFormat)
}

/// Access masks and pipeline stages for the layout transitions we perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_barrier(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<TransitionBarrier, ImageError> {
    use vk::ImageLayout as L;

    match (from, to) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Ok(TransitionBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(TransitionBarrier {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => Ok(TransitionBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        }),
        _ => Err(ImageError::UnsupportedTransition { from, to }),
    }
}

fn aspect_for_layout(format: vk::Format, layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    if layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Record a layout transition covering every mip level of `image`.
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    mip_levels: u32,
) -> Result<(), ImageError> {
    let stages = transition_barrier(from, to)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(from)
        .new_layout(to)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_for_layout(format, to),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(stages.src_access)
        .dst_access_mask(stages.dst_access)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            stages.src_stage,
            stages.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    Ok(())
}

pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }.context("Failed to create image view")
}

/// Image creation settings
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// Device-local 2D image with its memory and a view over all mip levels
pub struct Image {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    device: Arc<VulkanDevice>,
}

impl Image {
    pub fn new(device: Arc<VulkanDevice>, desc: ImageDesc) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let mut image = Self {
            handle,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            device,
        };

        let mem_requirements = unsafe {
            image.device.device.get_image_memory_requirements(handle)
        };
        let memory_type_index = image.device.find_memory_type(
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        image.memory = unsafe { image.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate image memory")?;
        unsafe { image.device.device.bind_image_memory(handle, image.memory, 0) }
            .context("Failed to bind image memory")?;

        image.view = create_image_view(
            &image.device.device,
            handle,
            desc.format,
            desc.aspect,
            desc.mip_levels,
        )?;

        Ok(image)
    }

    /// Depth attachment matching the swapchain extent and sample count.
    pub fn depth_attachment(
        device: Arc<VulkanDevice>,
        commands: &CommandPools,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let image = Self::new(
            device,
            ImageDesc {
                extent,
                format,
                mip_levels: 1,
                samples,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
        )?;

        commands.one_time_submit(|device, cmd| {
            record_transition(
                device,
                cmd,
                image.handle,
                format,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                1,
            )?;
            Ok(())
        })?;

        Ok(image)
    }

    /// Transient multisampled color target that resolves into the swapchain image.
    pub fn color_attachment(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        Self::new(
            device,
            ImageDesc {
                extent,
                format,
                mip_levels: 1,
                samples,
                usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.handle, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Pick the best supported depth format for optimal tiling.
pub fn select_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    let format = find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |format| unsafe {
            device
                .instance
                .get_physical_device_format_properties(device.physical.handle, format)
        },
    )?;
    log::info!("Depth format: {:?}", format);
    Ok(format)
}

/// Sampled texture with a full mip chain
pub struct Texture {
    pub sampler: vk::Sampler,
    pub image: Image,
}

impl Texture {
    /// Decode an image file, upload it and generate its mip chain.
    pub fn load(
        device: Arc<VulkanDevice>,
        commands: &CommandPools,
        path: &Path,
    ) -> Result<Self> {
        let bytes = crate::content::read_asset(path)?;
        let pixels = ::image::load_from_memory(&bytes)
            .with_context(|| format!("Failed to load texture image {}", path.display()))?
            .to_rgba8();
        let (width, height) = pixels.dimensions();

        log::info!("Loaded texture {} ({}x{})", path.display(), width, height);

        Self::from_rgba(device, commands, width, height, pixels.as_raw())
    }

    pub fn from_rgba(
        device: Arc<VulkanDevice>,
        commands: &CommandPools,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<Self> {
        let mip_levels = mip_level_count(width, height);
        let staging = Buffer::staging(device.clone(), rgba)?;

        let image = Image::new(
            device.clone(),
            ImageDesc {
                extent: vk::Extent2D { width, height },
                format: TEXTURE_FORMAT,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        let format_props = unsafe {
            device
                .instance
                .get_physical_device_format_properties(device.physical.handle, TEXTURE_FORMAT)
        };
        if !format_props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(ImageError::NoLinearBlit(TEXTURE_FORMAT).into());
        }

        commands.one_time_submit(|device, cmd| {
            record_transition(
                device,
                cmd,
                image.handle,
                TEXTURE_FORMAT,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                mip_levels,
            )?;

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle,
                    image.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            // Leaves every level in SHADER_READ_ONLY_OPTIMAL
            record_mipmaps(device, cmd, image.handle, width, height, mip_levels);
            Ok(())
        })?;

        let sampler = create_sampler(&device, mip_levels)?;

        Ok(Self { sampler, image })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.image.device.device.destroy_sampler(self.sampler, None) };
    }
}

/// Source and destination sizes for each blit in the mip chain.
pub fn mip_blit_extents(width: u32, height: u32, mip_levels: u32) -> Vec<((i32, i32), (i32, i32))> {
    let mut extents = Vec::with_capacity(mip_levels.saturating_sub(1) as usize);
    let (mut w, mut h) = (width as i32, height as i32);

    for _ in 1..mip_levels {
        let next = ((w / 2).max(1), (h / 2).max(1));
        extents.push(((w, h), next));
        (w, h) = next;
    }
    extents
}

/// Downsample level i-1 into level i with linear blits. Expects every level
/// in TRANSFER_DST_OPTIMAL and leaves them all in SHADER_READ_ONLY_OPTIMAL.
fn record_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) {
    let level_barrier = |level: u32,
                         old_layout: vk::ImageLayout,
                         new_layout: vk::ImageLayout,
                         src_access: vk::AccessFlags,
                         dst_access: vk::AccessFlags| {
        vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: level,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build()
    };

    for (i, ((src_w, src_h), (dst_w, dst_h))) in mip_blit_extents(width, height, mip_levels)
        .into_iter()
        .enumerate()
    {
        let level = i as u32 + 1;

        let to_src = level_barrier(
            level - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
        );
        let blit = vk::ImageBlit::builder()
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D { x: src_w, y: src_h, z: 1 },
            ])
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D { x: dst_w, y: dst_h, z: 1 },
            ])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        let to_shader = level_barrier(
            level - 1,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_READ,
        );

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_src],
            );
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        }
    }

    // The last level was only ever a blit destination
    let last = level_barrier(
        mip_levels - 1,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::AccessFlags::SHADER_READ,
    );
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[last],
        );
    }
}

fn create_sampler(device: &VulkanDevice, mip_levels: u32) -> Result<vk::Sampler> {
    let max_anisotropy = device.physical.properties.limits.max_sampler_anisotropy;

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(device.sampler_anisotropy)
        .max_anisotropy(if device.sampler_anisotropy { max_anisotropy } else { 1.0 })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(mip_levels as f32);

    unsafe { device.device.create_sampler(&sampler_info, None) }
        .context("Failed to create texture sampler")
}
