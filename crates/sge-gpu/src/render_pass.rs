//! Render passes.
//!
//! Every render pass belongs to exactly one parent: the swapchain or an
//! offscreen [`Framebuffer`](crate::framebuffer::Framebuffer). The parent
//! decides the final attachment layouts and rebuilds the pass whenever it is
//! itself recreated.

use ash::vk;
use glam::Vec4;

use crate::backend::{AttachmentDesc, RenderPassBegin, RenderPassDesc};
use crate::command::CommandList;
use crate::context::GpuContext;
use crate::error::Result;

/// Owner of a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderPassParent {
    /// Draws into swapchain images, which end up ready for presentation.
    Swapchain,
    /// Draws into offscreen attachments, which end up ready for sampling.
    Framebuffer,
}

/// A render pass with cleared attachments.
pub struct RenderPass {
    handle: vk::RenderPass,
    parent: RenderPassParent,
    color: Vec<AttachmentDesc>,
    depth: Option<AttachmentDesc>,
}

impl RenderPass {
    /// Single color attachment presented after the pass.
    pub fn for_swapchain(ctx: &GpuContext, format: vk::Format) -> Result<Self> {
        let color = vec![AttachmentDesc {
            format,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }];
        Self::new(ctx, RenderPassParent::Swapchain, color, None)
    }

    /// Color attachments left sampleable, plus an optional depth attachment.
    pub fn for_framebuffer(
        ctx: &GpuContext,
        color_formats: &[vk::Format],
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let color = color_formats
            .iter()
            .map(|&format| AttachmentDesc {
                format,
                final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let depth = depth_format.map(|format| AttachmentDesc {
            format,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        Self::new(ctx, RenderPassParent::Framebuffer, color, depth)
    }

    fn new(
        ctx: &GpuContext,
        parent: RenderPassParent,
        color: Vec<AttachmentDesc>,
        depth: Option<AttachmentDesc>,
    ) -> Result<Self> {
        let desc = RenderPassDesc { color, depth };
        let handle = ctx.device().create_render_pass(&desc)?;
        tracing::debug!(
            "Created {:?} render pass with {} color attachment(s)",
            parent,
            desc.color.len()
        );
        Ok(Self {
            handle,
            parent,
            color: desc.color,
            depth: desc.depth,
        })
    }

    /// Begin the pass on `framebuffer`, clearing color attachments to
    /// `clear_color` and depth to 1.0.
    ///
    /// Fails with [`GpuError::InvalidState`](crate::GpuError::InvalidState)
    /// if the list already has an active pass.
    pub fn begin(
        &self,
        list: &mut CommandList,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: Vec4,
    ) -> Result<()> {
        list.begin_render_pass(&RenderPassBegin {
            render_pass: self.handle,
            framebuffer,
            extent,
            clear_color: clear_color.to_array(),
            color_attachments: self.color_attachment_count(),
            has_depth: self.depth.is_some(),
        })
    }

    /// End the active pass.
    pub fn end(&self, list: &mut CommandList) -> Result<()> {
        list.end_render_pass()
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn parent(&self) -> RenderPassParent {
        self.parent
    }

    pub fn color_attachment_count(&self) -> u32 {
        u32::try_from(self.color.len()).unwrap_or(u32::MAX)
    }

    pub fn has_depth(&self) -> bool {
        self.depth.is_some()
    }

    /// Layout color attachments are left in when the pass ends.
    pub fn color_final_layout(&self) -> vk::ImageLayout {
        match self.parent {
            RenderPassParent::Swapchain => vk::ImageLayout::PRESENT_SRC_KHR,
            RenderPassParent::Framebuffer => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Layout the depth attachment is left in when the pass ends.
    pub fn depth_final_layout(&self) -> Option<vk::ImageLayout> {
        self.depth.map(|depth| depth.final_layout)
    }

    pub fn destroy(&mut self, ctx: &GpuContext) {
        if self.handle != vk::RenderPass::null() {
            ctx.device().destroy_render_pass(self.handle);
            self.handle = vk::RenderPass::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::command::QueueKind;
    use crate::context::GpuContextBuilder;
    use crate::error::GpuError;

    #[test]
    fn parent_decides_final_layouts() {
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(Arc::new(SoftInstance::single()))
            .unwrap();
        let mut present = RenderPass::for_swapchain(&ctx, vk::Format::B8G8R8A8_SRGB).unwrap();
        let mut offscreen = RenderPass::for_framebuffer(
            &ctx,
            &[vk::Format::R8G8B8A8_UNORM],
            Some(vk::Format::D32_SFLOAT),
        )
        .unwrap();

        assert_eq!(present.parent(), RenderPassParent::Swapchain);
        assert_eq!(present.color_final_layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(present.depth_final_layout(), None);
        assert_eq!(offscreen.parent(), RenderPassParent::Framebuffer);
        assert_eq!(
            offscreen.depth_final_layout(),
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        );

        present.destroy(&ctx);
        offscreen.destroy(&ctx);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn nested_begin_and_stray_end_are_rejected() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        let mut pass = RenderPass::for_framebuffer(&ctx, &[vk::Format::R8G8B8A8_UNORM], None).unwrap();
        let extent = vk::Extent2D { width: 4, height: 4 };

        let mut list = ctx.get(QueueKind::Graphics).unwrap();
        assert!(matches!(pass.end(&mut list), Err(GpuError::InvalidState(_))));
        pass.begin(&mut list, vk::Framebuffer::null(), extent, Vec4::ZERO)
            .unwrap();
        assert!(matches!(
            pass.begin(&mut list, vk::Framebuffer::null(), extent, Vec4::ZERO),
            Err(GpuError::InvalidState(_))
        ));
        pass.end(&mut list).unwrap();
        assert!(!list.is_in_render_pass());

        // Never submitted: the list records against a null framebuffer.
        drop(list);
        pass.destroy(&ctx);
        ctx.shutdown().unwrap();
    }
}
