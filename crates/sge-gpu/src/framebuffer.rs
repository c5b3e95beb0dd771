//! Offscreen framebuffers.

use ash::vk;
use glam::Vec4;
use sge_core::{ImageFormat, ImageSpec, ImageUsage};

use crate::backend::FramebufferDesc;
use crate::command::CommandList;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::image::Image2D;
use crate::render_pass::RenderPass;

/// Description of an offscreen render target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramebufferSpec {
    pub width: u32,
    pub height: u32,
    pub color_formats: Vec<ImageFormat>,
    pub depth_format: Option<ImageFormat>,
    /// Usage added to the color attachments, e.g. `TRANSFER_SRC` for readback.
    pub extra_usage: ImageUsage,
}

impl FramebufferSpec {
    /// One RGBA color attachment and no depth.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            color_formats: vec![ImageFormat::Rgba8Unorm],
            depth_format: None,
            extra_usage: ImageUsage::empty(),
        }
    }

    pub fn with_color_formats(mut self, formats: Vec<ImageFormat>) -> Self {
        self.color_formats = formats;
        self
    }

    pub fn with_depth(mut self, format: ImageFormat) -> Self {
        self.depth_format = Some(format);
        self
    }

    pub fn with_extra_usage(mut self, usage: ImageUsage) -> Self {
        self.extra_usage = usage;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.color_formats.is_empty() && self.depth_format.is_none() {
            return Err(GpuError::InvalidDescription(
                "framebuffer needs at least one attachment".to_string(),
            ));
        }
        if let Some(format) = self.color_formats.iter().find(|format| format.is_depth()) {
            return Err(GpuError::InvalidDescription(format!(
                "{format:?} cannot be a color attachment"
            )));
        }
        if matches!(self.depth_format, Some(format) if !format.is_depth()) {
            return Err(GpuError::InvalidDescription(format!(
                "{:?} is not a depth format",
                self.depth_format
            )));
        }
        Ok(())
    }
}

/// An offscreen render target that owns its attachment images and the
/// render pass drawing into them.
pub struct Framebuffer {
    spec: FramebufferSpec,
    name: String,
    color: Vec<Image2D>,
    depth: Option<Image2D>,
    render_pass: RenderPass,
    handle: vk::Framebuffer,
}

impl Framebuffer {
    pub fn new(ctx: &GpuContext, spec: FramebufferSpec, name: &str) -> Result<Self> {
        spec.validate()?;
        let (color, depth) = Self::create_attachments(ctx, &spec, name)?;
        let color_formats: Vec<vk::Format> = color.iter().map(Image2D::vk_format).collect();
        let mut render_pass = RenderPass::for_framebuffer(
            ctx,
            &color_formats,
            depth.as_ref().map(Image2D::vk_format),
        )?;

        let views: Vec<vk::ImageView> = color.iter().chain(depth.iter()).map(Image2D::view).collect();
        let handle = match ctx.device().create_framebuffer(&FramebufferDesc {
            render_pass: render_pass.handle(),
            attachments: &views,
            extent: vk::Extent2D {
                width: spec.width,
                height: spec.height,
            },
        }) {
            Ok(handle) => handle,
            Err(err) => {
                render_pass.destroy(ctx);
                for mut image in color.into_iter().chain(depth) {
                    image.destroy(ctx)?;
                }
                return Err(err);
            }
        };

        tracing::debug!("Created framebuffer '{}' {}x{}", name, spec.width, spec.height);
        Ok(Self {
            spec,
            name: name.to_string(),
            color,
            depth,
            render_pass,
            handle,
        })
    }

    fn create_attachments(
        ctx: &GpuContext,
        spec: &FramebufferSpec,
        name: &str,
    ) -> Result<(Vec<Image2D>, Option<Image2D>)> {
        let mut color = Vec::with_capacity(spec.color_formats.len());
        let color_usage = ImageUsage::ATTACHMENT | ImageUsage::TEXTURE | spec.extra_usage;
        for (index, &format) in spec.color_formats.iter().enumerate() {
            let image_spec = ImageSpec::new(spec.width, spec.height, format, color_usage);
            match Image2D::new(ctx, &image_spec, &format!("{name} color {index}")) {
                Ok(image) => color.push(image),
                Err(err) => {
                    for mut image in color {
                        image.destroy(ctx)?;
                    }
                    return Err(err);
                }
            }
        }

        let depth = match spec.depth_format {
            Some(format) => {
                let image_spec = ImageSpec::new(spec.width, spec.height, format, ImageUsage::ATTACHMENT);
                match Image2D::new(ctx, &image_spec, &format!("{name} depth")) {
                    Ok(image) => Some(image),
                    Err(err) => {
                        for mut image in color {
                            image.destroy(ctx)?;
                        }
                        return Err(err);
                    }
                }
            }
            None => None,
        };
        Ok((color, depth))
    }

    /// Begin drawing into this framebuffer.
    pub fn begin_render_pass(&self, list: &mut CommandList, clear_color: Vec4) -> Result<()> {
        self.render_pass
            .begin(list, self.handle, self.extent(), clear_color)
    }

    /// End the pass. Attachments are tracked in the pass's final layouts
    /// from here on.
    pub fn end_render_pass(&mut self, list: &mut CommandList) -> Result<()> {
        self.render_pass.end(list)?;
        let color_layout = self.render_pass.color_final_layout();
        for image in &mut self.color {
            image.assume_layout(color_layout);
        }
        if let (Some(image), Some(layout)) = (&mut self.depth, self.render_pass.depth_final_layout()) {
            image.assume_layout(layout);
        }
        Ok(())
    }

    /// Rebuild attachments, framebuffer and render pass at a new size.
    ///
    /// Waits for the device to go idle first.
    pub fn resize(&mut self, ctx: &GpuContext, width: u32, height: u32) -> Result<()> {
        if width == self.spec.width && height == self.spec.height {
            return Ok(());
        }
        ctx.wait_idle()?;
        let spec = FramebufferSpec {
            width,
            height,
            ..self.spec.clone()
        };
        let rebuilt = Self::new(ctx, spec, &self.name)?;
        let mut old = std::mem::replace(self, rebuilt);
        old.destroy(ctx)
    }

    pub fn spec(&self) -> &FramebufferSpec {
        &self.spec
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.spec.width,
            height: self.spec.height,
        }
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// Raw framebuffer handle.
    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn color_attachment_count(&self) -> usize {
        self.color.len()
    }

    pub fn color_attachment(&self, index: usize) -> Option<&Image2D> {
        self.color.get(index)
    }

    /// Mutable access, for layout transitions and readback.
    pub fn color_attachment_mut(&mut self, index: usize) -> Option<&mut Image2D> {
        self.color.get_mut(index)
    }

    pub fn depth_attachment(&self) -> Option<&Image2D> {
        self.depth.as_ref()
    }

    /// Release attachments, framebuffer and render pass.
    pub fn destroy(&mut self, ctx: &GpuContext) -> Result<()> {
        if self.handle != vk::Framebuffer::null() {
            ctx.device().destroy_framebuffer(self.handle);
            self.handle = vk::Framebuffer::null();
        }
        self.render_pass.destroy(ctx);
        for image in self.color.iter_mut().chain(self.depth.iter_mut()) {
            image.destroy(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::soft::{encode_clear, SoftInstance};
    use crate::command::QueueKind;
    use crate::context::GpuContextBuilder;

    fn context() -> (Arc<SoftInstance>, GpuContext) {
        let instance = Arc::new(SoftInstance::single());
        let ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        (instance, ctx)
    }

    #[test]
    fn cleared_framebuffer_reads_back_clear_color() {
        let (instance, mut ctx) = context();
        let spec = FramebufferSpec::new(4, 2)
            .with_depth(ImageFormat::Depth32Float)
            .with_extra_usage(ImageUsage::TRANSFER_SRC);
        let mut framebuffer = Framebuffer::new(&ctx, spec, "offscreen").unwrap();
        let clear = Vec4::new(1.0, 0.5, 0.0, 1.0);

        let mut list = ctx.get(QueueKind::Graphics).unwrap();
        framebuffer.begin_render_pass(&mut list, clear).unwrap();
        framebuffer.end_render_pass(&mut list).unwrap();
        ctx.submit(list, true).unwrap();

        let color = framebuffer.color_attachment_mut(0).unwrap();
        assert_eq!(color.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let mut out = vec![0; 4 * 2 * 4];
        assert!(color.copy_to(&ctx, &mut out).unwrap());
        let texel = encode_clear(vk::Format::R8G8B8A8_UNORM, clear.to_array());
        assert!(out.chunks_exact(4).all(|chunk| chunk == texel));
        assert_eq!(
            framebuffer.depth_attachment().unwrap().layout(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        framebuffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        let soft = instance.device().unwrap();
        assert!(soft.validation_errors().is_empty(), "{:?}", soft.validation_errors());
        assert_eq!(soft.live_objects(), 0);
    }

    #[test]
    fn resize_rebuilds_attachments() {
        let (_instance, mut ctx) = context();
        let mut framebuffer = Framebuffer::new(&ctx, FramebufferSpec::new(8, 8), "resized").unwrap();
        let old_id = framebuffer.color_attachment(0).unwrap().id();

        framebuffer.resize(&ctx, 16, 4).unwrap();
        let color = framebuffer.color_attachment(0).unwrap();
        assert_eq!(color.extent(), vk::Extent2D { width: 16, height: 4 });
        assert_ne!(color.id(), old_id);
        assert_eq!(ctx.allocator().lock().live_count(), 1);

        framebuffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn depth_formats_are_not_color_attachments() {
        let (_instance, mut ctx) = context();
        let spec = FramebufferSpec::new(2, 2).with_color_formats(vec![ImageFormat::Depth32Float]);
        assert!(matches!(
            Framebuffer::new(&ctx, spec, "bad"),
            Err(GpuError::InvalidDescription(_))
        ));
        ctx.shutdown().unwrap();
    }
}
