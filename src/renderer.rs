// =============================================================================
// RENDERER - Owns every GPU resource and drives the frame protocol
// =============================================================================
//
// Resources split by lifetime:
//
//   static       device, command pools, frame slots, texture, geometry,
//                descriptor set layout, shader code, depth format
//   per-swapchain swapchain, attachments, render pass, pipeline,
//                framebuffers, uniform buffers, descriptor sets,
//                recorded command buffers
//
// A swapchain rebuild drops the whole per-swapchain generation and builds a
// new one. Rust drops struct fields in declaration order, so each struct
// lists its fields from most to least dependent.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::buffer::Buffer;
use crate::backend::commands::{CommandBuffers, CommandPools};
use crate::backend::descriptor::{DescriptorSetLayout, DescriptorSets};
use crate::backend::device::DeviceDesc;
use crate::backend::image::{select_depth_format, Image, Texture};
use crate::backend::pipeline::{Framebuffers, GraphicsPipeline, PipelineDesc, RenderPass, RenderPassDesc};
use crate::backend::shader::load_spirv;
use crate::backend::sync::FrameSlot;
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;
use crate::content::ContentDirs;
use crate::frame::{AcquireOutcome, FrameDriver, FrameScheduler, FrameStatus, PresentOutcome};
use crate::recorder::{record_draw, DrawParams, DrawTarget};
use crate::scene::{UniformBufferObject, INDICES, VERTICES};

/// Renderer settings taken from the config
#[derive(Debug, Clone)]
struct RenderSettings {
    clear_color: [f32; 4],
    present_priority: Vec<vk::PresentModeKHR>,
}

/// Everything sized by or tied to one swapchain. Fields with a leading
/// underscore are only referenced by the recorded command buffers.
struct SwapchainResources {
    command_buffers: CommandBuffers,
    _descriptor_sets: DescriptorSets,
    uniform_buffers: Vec<Buffer>,
    _framebuffers: Framebuffers,
    _pipeline: GraphicsPipeline,
    _render_pass: RenderPass,
    _depth: Image,
    _color: Option<Image>,
    swapchain: Swapchain,
}

/// GPU state the frame protocol operates on
struct RenderContext {
    generation: Option<SwapchainResources>,
    frame_slots: Vec<FrameSlot>,
    descriptor_set_layout: DescriptorSetLayout,
    index_buffer: Buffer,
    vertex_buffer: Buffer,
    texture: Texture,
    commands: CommandPools,
    vertex_shader: Vec<u32>,
    fragment_shader: Vec<u32>,
    depth_format: vk::Format,
    msaa_samples: vk::SampleCountFlags,
    settings: RenderSettings,
    start_time: Instant,
    window: Arc<Window>,
    device: Arc<VulkanDevice>,
}

pub struct Renderer {
    frames: FrameScheduler,
    context: RenderContext,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: &Config, content: &ContentDirs) -> Result<Self> {
        let device = VulkanDevice::new(
            &window,
            &DeviceDesc {
                app_name: config.window.title.clone(),
                enable_validation: config.debug.validation_layers,
                sampler_anisotropy: config.graphics.sampler_anisotropy,
            },
        )?;

        // Static resources, created once
        let commands = CommandPools::new(device.clone())?;
        let depth_format = select_depth_format(&device)?;
        let msaa_samples = device
            .physical
            .max_usable_sample_count(config.graphics.msaa_samples);
        log::info!("MSAA samples: {:?}", msaa_samples);

        let vertex_shader = load_spirv(&content.shader(&config.content.vertex_shader))?;
        let fragment_shader = load_spirv(&content.shader(&config.content.fragment_shader))?;

        let texture = Texture::load(
            device.clone(),
            &commands,
            &content.texture(&config.content.texture),
        )?;
        let vertex_buffer = Buffer::device_local_with_data(
            device.clone(),
            &commands,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &VERTICES,
        )?;
        let index_buffer = Buffer::device_local_with_data(
            device.clone(),
            &commands,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &INDICES,
        )?;
        let descriptor_set_layout = DescriptorSetLayout::new(device.clone())?;

        let max_frames_in_flight = config.graphics.max_frames_in_flight;
        let frame_slots = FrameSlot::create_all(&device, max_frames_in_flight)?;

        device.set_object_name(vertex_buffer.handle, "vertex buffer")?;
        device.set_object_name(index_buffer.handle, "index buffer")?;
        device.set_object_name(texture.image.handle, "texture")?;
        for (i, slot) in frame_slots.iter().enumerate() {
            device.set_object_name(slot.in_flight, &format!("in-flight fence {}", i))?;
        }

        let mut context = RenderContext {
            generation: None,
            frame_slots,
            descriptor_set_layout,
            index_buffer,
            vertex_buffer,
            texture,
            commands,
            vertex_shader,
            fragment_shader,
            depth_format,
            msaa_samples,
            settings: RenderSettings {
                clear_color: config.graphics.clear_color,
                present_priority: config.present_mode_priority(),
            },
            start_time: Instant::now(),
            window,
            device,
        };

        // A window created minimized has no area yet; the first frame retries
        let image_count = context.recreate_swapchain()?;
        let mut frames = FrameScheduler::new(max_frames_in_flight, image_count.unwrap_or(0));
        if image_count.is_none() {
            frames.request_recreate();
        }

        Ok(Self { frames, context })
    }

    /// Called from the window's resize event.
    pub fn notify_resized(&mut self) {
        self.frames.notify_resized();
    }

    pub fn draw_frame(&mut self) -> Result<FrameStatus> {
        self.frames.draw_frame(&mut self.context)
    }

    /// Block until the GPU is idle, e.g. before tearing down.
    pub fn wait_idle(&self) -> Result<()> {
        self.context.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be destroyed while the GPU still uses it
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
    }
}

impl RenderContext {
    fn generation(&self) -> Result<&SwapchainResources> {
        self.generation
            .as_ref()
            .context("Swapchain resources are not available")
    }

    fn slot(&self, slot: usize) -> Result<&FrameSlot> {
        self.frame_slots
            .get(slot)
            .with_context(|| format!("Frame slot {} out of range", slot))
    }

    fn framebuffer_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn build_swapchain_resources(&self, extent: vk::Extent2D) -> Result<SwapchainResources> {
        let device = &self.device;

        let swapchain = Swapchain::new(device.clone(), extent, &self.settings.present_priority)?;
        let extent = swapchain.extent;

        // Multisampled color target; the swapchain image becomes the resolve target
        let color = if self.msaa_samples != vk::SampleCountFlags::TYPE_1 {
            Some(Image::color_attachment(
                device.clone(),
                extent,
                swapchain.format,
                self.msaa_samples,
            )?)
        } else {
            None
        };
        let depth = Image::depth_attachment(
            device.clone(),
            &self.commands,
            extent,
            self.depth_format,
            self.msaa_samples,
        )?;

        let render_pass = RenderPass::new(
            device.clone(),
            RenderPassDesc {
                color_format: swapchain.format,
                depth_format: self.depth_format,
                samples: self.msaa_samples,
            },
        )?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            &render_pass,
            &PipelineDesc {
                vertex_shader: &self.vertex_shader,
                fragment_shader: &self.fragment_shader,
                descriptor_set_layout: self.descriptor_set_layout.handle,
                extent,
            },
        )?;
        let framebuffers = Framebuffers::new(
            device.clone(),
            &render_pass,
            &swapchain.image_views,
            depth.view,
            color.as_ref().map(|c| c.view),
            extent,
        )?;

        let uniform_buffers = (0..swapchain.image_count())
            .map(|_| Buffer::uniform::<UniformBufferObject>(device.clone()))
            .collect::<Result<Vec<_>>>()?;
        let descriptor_sets = DescriptorSets::new(
            device.clone(),
            &self.descriptor_set_layout,
            &uniform_buffers,
            &self.texture,
        )?;

        device.set_object_name(render_pass.handle, "main render pass")?;
        device.set_object_name(pipeline.pipeline, "graphics pipeline")?;

        let command_buffers = self.commands.allocate(swapchain.image_count())?;
        let params = DrawParams {
            render_pass: render_pass.handle,
            extent,
            clear_color: self.settings.clear_color,
            pipeline: pipeline.pipeline,
            pipeline_layout: pipeline.layout,
            vertex_buffer: self.vertex_buffer.handle,
            index_buffer: self.index_buffer.handle,
            index_count: INDICES.len() as u32,
        };
        for (i, cmd) in command_buffers.iter().enumerate() {
            let target = DrawTarget {
                framebuffer: framebuffers
                    .get(i)
                    .context("Missing framebuffer for swapchain image")?,
                descriptor_set: descriptor_sets
                    .get(i)
                    .context("Missing descriptor set for swapchain image")?,
            };
            device.set_object_name(cmd, &format!("draw commands {}", i))?;
            record_draw(&device.device, device.debug(), cmd, &params, &target)?;
        }

        Ok(SwapchainResources {
            command_buffers,
            _descriptor_sets: descriptor_sets,
            uniform_buffers,
            _framebuffers: framebuffers,
            _pipeline: pipeline,
            _render_pass: render_pass,
            _depth: depth,
            _color: color,
            swapchain,
        })
    }
}

impl FrameDriver for RenderContext {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.slot(slot)?.image_available;
        self.generation()?.swapchain.acquire_next_image(semaphore)
    }

    fn update_frame_data(&mut self, image_index: u32) -> Result<()> {
        let generation = self.generation()?;
        let ubo = UniformBufferObject::at_time(
            self.start_time.elapsed().as_secs_f32(),
            generation.swapchain.extent,
        );
        generation
            .uniform_buffers
            .get(image_index as usize)
            .context("Missing uniform buffer for swapchain image")?
            .write(&[ubo])
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = self.slot(slot)?;
        let cmd = self
            .generation()?
            .command_buffers
            .get(image_index as usize)
            .context("Missing command buffer for swapchain image")?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        frame.reset()?;
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                std::slice::from_ref(&submit_info),
                frame.in_flight,
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let wait = [self.slot(slot)?.render_finished];
        self.generation()?
            .swapchain
            .present(self.device.present_queue, image_index, &wait)
    }

    fn recreate_swapchain(&mut self) -> Result<Option<usize>> {
        let extent = self.framebuffer_extent();
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Window has no drawable area, postponing swapchain rebuild");
            return Ok(None);
        }

        self.device.wait_idle()?;

        // The old generation must be gone before the surface gets a new swapchain
        self.generation = None;
        let resources = self
            .build_swapchain_resources(extent)
            .context("Failed to recreate swapchain")?;
        let image_count = resources.swapchain.image_count();
        self.generation = Some(resources);

        Ok(Some(image_count))
    }
}
