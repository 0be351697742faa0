// Graphics pipeline creation and management
//
// The render pass, pipeline and framebuffers all depend on the swapchain
// format and extent, so they are rebuilt with every swapchain generation.
//
// Attachment layout of the single subpass:
//   0: color   (multisampled target, or the swapchain image when samples == 1)
//   1: depth
//   2: resolve (swapchain image; only when samples > 1)

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use crate::scene::Vertex;
use super::shader::ShaderModule;
use super::VulkanDevice;

/// Render pass creation settings
#[derive(Debug, Clone, Copy)]
pub struct RenderPassDesc {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

impl RenderPassDesc {
    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }

    /// Attachment descriptions in framebuffer order.
    pub fn attachments(&self) -> Vec<vk::AttachmentDescription> {
        let multisampled = self.is_multisampled();

        let color = vk::AttachmentDescription::builder()
            .format(self.color_format)
            .samples(self.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(if multisampled {
                vk::AttachmentStoreOp::DONT_CARE
            } else {
                vk::AttachmentStoreOp::STORE
            })
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(if multisampled {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::PRESENT_SRC_KHR
            })
            .build();

        // Depth is not needed after the pass
        let depth = vk::AttachmentDescription::builder()
            .format(self.depth_format)
            .samples(self.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let mut attachments = vec![color, depth];

        if multisampled {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(self.color_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .build(),
            );
        }

        attachments
    }
}

pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub desc: RenderPassDesc,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    pub fn new(device: Arc<VulkanDevice>, desc: RenderPassDesc) -> Result<Self> {
        let attachments = desc.attachments();

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_refs = [vk::AttachmentReference {
            attachment: 2,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref);
        if desc.is_multisampled() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass.build()];

        // Wait for the acquired image (and the previous depth use) before writing
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        Ok(Self {
            handle,
            desc,
            device,
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

/// Framebuffer attachments for one swapchain image, in render pass order.
pub fn framebuffer_attachments(
    swapchain_view: vk::ImageView,
    depth_view: vk::ImageView,
    color_view: Option<vk::ImageView>,
) -> Vec<vk::ImageView> {
    match color_view {
        Some(color_view) => vec![color_view, depth_view, swapchain_view],
        None => vec![swapchain_view, depth_view],
    }
}

/// One framebuffer per swapchain image
pub struct Framebuffers {
    pub handles: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl Framebuffers {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        swapchain_views: &[vk::ImageView],
        depth_view: vk::ImageView,
        color_view: Option<vk::ImageView>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut framebuffers = Self {
            handles: Vec::with_capacity(swapchain_views.len()),
            device,
        };

        for &view in swapchain_views {
            let attachments = framebuffer_attachments(view, depth_view, color_view);
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.handle)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let handle = unsafe {
                framebuffers
                    .device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
            }
            .context("Failed to create framebuffer")?;
            framebuffers.handles.push(handle);
        }

        Ok(framebuffers)
    }

    pub fn get(&self, index: usize) -> Option<vk::Framebuffer> {
        self.handles.get(index).copied()
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.handles {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

/// Graphics pipeline creation settings
pub struct PipelineDesc<'a> {
    pub vertex_shader: &'a [u32],
    pub fragment_shader: &'a [u32],
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub extent: vk::Extent2D,
}

pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl GraphicsPipeline {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        desc: &PipelineDesc<'_>,
    ) -> Result<Self> {
        // Modules are only needed until the pipeline exists
        let vert_module = ShaderModule::new(device.clone(), desc.vertex_shader)?;
        let frag_module = ShaderModule::new(device.clone(), desc.fragment_shader)?;

        let entry_point = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module.handle)
                .name(entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module.handle)
                .name(entry_point)
                .build(),
        ];

        // Vertex input
        let bindings = Vertex::binding_descriptions();
        let attributes = Vertex::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are baked in; the pipeline is rebuilt on resize
        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: desc.extent.width as f32,
            height: desc.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: desc.extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        // Projection flips Y, so front faces wind counter-clockwise on screen
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(render_pass.desc.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Opaque, no blending
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let set_layouts = [desc.descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);

        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass.handle)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
                device,
            }),
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                Err(e).context("Failed to create graphics pipeline")
            }
        }
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn desc(samples: vk::SampleCountFlags) -> RenderPassDesc {
        RenderPassDesc {
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: vk::Format::D32_SFLOAT,
            samples,
        }
    }

    #[test]
    fn single_sample_pass_presents_color_directly() {
        let attachments = desc(vk::SampleCountFlags::TYPE_1).attachments();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachments[1].format, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn multisampled_pass_resolves_into_presentable_image() {
        let attachments = desc(vk::SampleCountFlags::TYPE_4).attachments();
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[0].store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn framebuffer_order_matches_attachments() {
        let swap = vk::ImageView::from_raw(1);
        let depth = vk::ImageView::from_raw(2);
        let color = vk::ImageView::from_raw(3);
        assert_eq!(framebuffer_attachments(swap, depth, None), vec![swap, depth]);
        assert_eq!(
            framebuffer_attachments(swap, depth, Some(color)),
            vec![color, depth, swap]
        );
    }
}
