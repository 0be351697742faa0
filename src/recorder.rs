// Command recording
//
// Draw commands never change between frames, so one command buffer per
// swapchain image is recorded up front and resubmitted every frame. They
// are re-recorded only when the swapchain is rebuilt.

use anyhow::{Context, Result};
use ash::vk;

use crate::backend::debug::{DebugBridge, LabelColor, ScopedLabel};

/// Everything one image's draw needs.
#[derive(Debug, Clone, Copy)]
pub struct DrawTarget {
    pub framebuffer: vk::Framebuffer,
    pub descriptor_set: vk::DescriptorSet,
}

/// State shared by all images of a swapchain generation.
#[derive(Debug, Clone, Copy)]
pub struct DrawParams {
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
}

/// Clear values in attachment order: color, then depth at the far plane.
pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Record `cmd` to draw the indexed geometry into `target`. With a debug
/// bridge the draw is wrapped in a "draw frame" label.
pub fn record_draw(
    device: &ash::Device,
    debug: Option<&DebugBridge>,
    cmd: vk::CommandBuffer,
    params: &DrawParams,
    target: &DrawTarget,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    unsafe { device.begin_command_buffer(cmd, &begin_info) }
        .context("Failed to begin recording command buffer")?;

    let clear_values = clear_values(params.clear_color);
    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(params.render_pass)
        .framebuffer(target.framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: params.extent,
        })
        .clear_values(&clear_values);

    unsafe { device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE) };

    let label = ScopedLabel::begin(debug, cmd, c"draw frame", LabelColor::GREEN);
    unsafe {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, params.pipeline);
        device.cmd_bind_vertex_buffers(cmd, 0, &[params.vertex_buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, params.index_buffer, 0, vk::IndexType::UINT16);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            params.pipeline_layout,
            0,
            &[target.descriptor_set],
            &[],
        );
        device.cmd_draw_indexed(cmd, params.index_count, 1, 0, 0, 0);
    }
    drop(label);

    unsafe { device.cmd_end_render_pass(cmd) };

    unsafe { device.end_command_buffer(cmd) }.context("Failed to record command buffer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_is_cleared_first_and_depth_to_far_plane() {
        let values = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
            assert_eq!(values[1].depth_stencil.stencil, 0);
        }
    }
}
