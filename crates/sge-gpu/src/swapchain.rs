//! Swapchain management.

use ash::vk;
use glam::Vec4;

use crate::backend::{
    AcquiredImage, FramebufferDesc, ImageViewDesc, SurfaceCapabilities, SwapchainDesc,
};
use crate::command::CommandList;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::render_pass::RenderPass;

/// Swapchain wrapper.
///
/// Owns the presentable images, their views, the render pass parented to
/// the swapchain and one framebuffer per image. All of them are rebuilt
/// together by [`Swapchain::resize`].
pub struct Swapchain {
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: Option<RenderPass>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    vsync: bool,
    present_family: u32,
    present_queue: vk::Queue,
}

impl Swapchain {
    /// Create a swapchain for `surface`.
    ///
    /// The present queue is the first family able to present to the surface.
    pub fn new(
        ctx: &GpuContext,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let present_family = find_present_family(ctx, surface)?;
        let mut swapchain = Self {
            surface,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            render_pass: None,
            format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            vsync,
            present_family,
            present_queue: ctx.device().get_queue(present_family),
        };
        let support = ctx.device().surface_capabilities(surface)?;
        let extent = usable_extent(&support, width, height)?;
        if let Err(err) = swapchain.build(ctx, &support, extent) {
            swapchain.destroy(ctx);
            return Err(err);
        }
        Ok(swapchain)
    }

    fn build(
        &mut self,
        ctx: &GpuContext,
        support: &SurfaceCapabilities,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let device = ctx.device();
        let capabilities = &support.capabilities;

        self.format = select_surface_format(&support.formats)?;
        self.present_mode = select_present_mode(&support.present_modes, self.vsync);
        self.extent = extent;

        let mut families = vec![ctx.graphics_queue_family(), self.present_family];
        families.dedup();

        let old = self.handle;
        let (handle, images) = device.create_swapchain(&SwapchainDesc {
            surface: self.surface,
            min_image_count: image_count(capabilities),
            format: self.format,
            extent: self.extent,
            present_mode: self.present_mode,
            pre_transform: capabilities.current_transform,
            queue_families: &families,
            old_swapchain: old,
        })?;
        if old != vk::SwapchainKHR::null() {
            device.destroy_swapchain(old);
        }
        self.handle = handle;
        self.images = images;

        if let Err(err) = self.build_derived(ctx) {
            self.release_derived(ctx);
            return Err(err);
        }

        tracing::info!(
            "Swapchain {}x{} with {} images ({:?}, {:?})",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format.format,
            self.present_mode
        );
        Ok(())
    }

    /// Views, render pass and framebuffers for the current images. Whatever
    /// was created before a failure is left in place for `release_derived`.
    fn build_derived(&mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        for &image in &self.images {
            self.views.push(device.create_image_view(&ImageViewDesc {
                image,
                format: self.format.format,
                aspect: vk::ImageAspectFlags::COLOR,
                mip_levels: 1,
                array_layers: 1,
            })?);
        }

        let render_pass = self
            .render_pass
            .insert(RenderPass::for_swapchain(ctx, self.format.format)?)
            .handle();
        for &view in &self.views {
            self.framebuffers.push(device.create_framebuffer(&FramebufferDesc {
                render_pass,
                attachments: &[view],
                extent: self.extent,
            })?);
        }
        Ok(())
    }

    /// Destroy everything derived from the swapchain images, keeping the
    /// swapchain handle for reuse as `old_swapchain`.
    fn release_derived(&mut self, ctx: &GpuContext) {
        let device = ctx.device();
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer);
        }
        if let Some(mut render_pass) = self.render_pass.take() {
            render_pass.destroy(ctx);
        }
        for view in self.views.drain(..) {
            device.destroy_image_view(view);
        }
        self.images.clear();
    }

    /// Recreate the swapchain, its render pass and framebuffers.
    ///
    /// Waits for the device to go idle first. A surface without area is
    /// rejected before anything is torn down.
    pub fn resize(&mut self, ctx: &GpuContext, width: u32, height: u32) -> Result<()> {
        ctx.wait_idle()?;
        let support = ctx.device().surface_capabilities(self.surface)?;
        let extent = usable_extent(&support, width, height)?;
        self.release_derived(ctx);
        self.build(ctx, &support, extent)
    }

    /// Acquire the next image.
    ///
    /// Returns `None` when the swapchain is out of date and must be resized.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image(
        &self,
        ctx: &GpuContext,
        semaphore: vk::Semaphore,
    ) -> Result<Option<AcquiredImage>> {
        match ctx.device().acquire_next_image(self.handle, semaphore) {
            Ok(acquired) => Ok(Some(acquired)),
            Err(GpuError::SwapchainOutOfDate) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Present an image. Returns true if the swapchain should be recreated.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present(
        &self,
        ctx: &GpuContext,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        ctx.device()
            .queue_present(self.present_queue, self.handle, image_index, wait_semaphores)
    }

    /// Begin the render pass drawing into swapchain image `image_index`.
    pub fn begin_present_pass(
        &self,
        list: &mut CommandList,
        image_index: u32,
        clear_color: Vec4,
    ) -> Result<()> {
        let framebuffer = self
            .framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("no swapchain image {image_index}")))?;
        self.render_pass()?
            .begin(list, framebuffer, self.extent, clear_color)
    }

    /// End the present pass; the image is then ready for presentation.
    pub fn end_present_pass(&self, list: &mut CommandList) -> Result<()> {
        self.render_pass()?.end(list)
    }

    /// The render pass parented to this swapchain.
    pub fn render_pass(&self) -> Result<&RenderPass> {
        self.render_pass
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("swapchain has been destroyed".to_string()))
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    pub fn framebuffer(&self, index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index as usize).copied()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn present_family(&self) -> u32 {
        self.present_family
    }

    /// Destroy the swapchain. The surface is left to its owner.
    pub fn destroy(&mut self, ctx: &GpuContext) {
        self.release_derived(ctx);
        if self.handle != vk::SwapchainKHR::null() {
            ctx.device().destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

fn find_present_family(ctx: &GpuContext, surface: vk::SurfaceKHR) -> Result<u32> {
    let count = u32::try_from(ctx.physical_device().queue_family_count()).unwrap_or(u32::MAX);
    for family in 0..count {
        if ctx.device().surface_support(family, surface)? {
            return Ok(family);
        }
    }
    Err(GpuError::SwapchainCreation(
        "no queue family can present to the surface".to_string(),
    ))
}

fn usable_extent(support: &SurfaceCapabilities, width: u32, height: u32) -> Result<vk::Extent2D> {
    let extent = calculate_extent(&support.capabilities, width, height);
    if extent.width == 0 || extent.height == 0 {
        return Err(GpuError::SwapchainCreation(
            "surface has a zero-sized extent".to_string(),
        ));
    }
    Ok(extent)
}

fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    // Prefer SRGB
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    // Mailbox, then immediate; FIFO is always supported.
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::backend::InstanceBackend;
    use crate::command::QueueKind;
    use crate::context::GpuContextBuilder;
    use crate::render_pass::RenderPassParent;

    #[test]
    fn format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            ..unorm
        };
        assert_eq!(select_surface_format(&[unorm, srgb]).unwrap(), srgb);
        assert_eq!(select_surface_format(&[unorm]).unwrap(), unorm);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_order() {
        use vk::PresentModeKHR as P;
        assert_eq!(select_present_mode(&[P::MAILBOX], true), P::FIFO);
        assert_eq!(select_present_mode(&[P::IMMEDIATE, P::MAILBOX], false), P::MAILBOX);
        assert_eq!(select_present_mode(&[P::IMMEDIATE], false), P::IMMEDIATE);
        assert_eq!(select_present_mode(&[], false), P::FIFO);
    }

    #[test]
    fn extent_is_clamped_when_surface_leaves_it_open() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            ..Default::default()
        };
        assert_eq!(
            calculate_extent(&capabilities, 400, 50),
            vk::Extent2D {
                width: 100,
                height: 50
            }
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(image_count(&capabilities), 3);
        capabilities.max_image_count = 2;
        assert_eq!(image_count(&capabilities), 2);
        capabilities.max_image_count = 0;
        assert_eq!(image_count(&capabilities), 3);
    }

    #[test]
    fn zero_sized_resize_keeps_the_swapchain() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new().build_with(instance.clone()).unwrap();
        let soft = instance.device().unwrap();
        let surface = instance.create_virtual_surface(32, 32);
        let mut swapchain = Swapchain::new(&ctx, surface, 32, 32, true).unwrap();
        let framebuffer = swapchain.framebuffer(0).unwrap();

        instance.set_surface_extent(surface, 0, 0);
        assert!(matches!(
            swapchain.resize(&ctx, 0, 0),
            Err(GpuError::SwapchainCreation(_))
        ));
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.framebuffer(0), Some(framebuffer));
        assert!(swapchain.render_pass().is_ok());

        instance.set_surface_extent(surface, 40, 20);
        swapchain.resize(&ctx, 40, 20).unwrap();
        assert_eq!(swapchain.extent(), vk::Extent2D { width: 40, height: 20 });

        swapchain.destroy(&ctx);
        instance.destroy_surface(surface);
        ctx.shutdown().unwrap();
        assert!(soft.validation_errors().is_empty());
        assert_eq!(soft.live_objects(), 0);
    }

    #[test]
    fn present_clears_and_resize_keeps_parent() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new().build_with(instance.clone()).unwrap();
        let soft = instance.device().unwrap();
        let surface = instance.create_virtual_surface(64, 32);
        let mut swapchain = Swapchain::new(&ctx, surface, 64, 32, true).unwrap();
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.format().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);

        let acquired = swapchain
            .acquire_next_image(&ctx, vk::Semaphore::null())
            .unwrap()
            .unwrap();
        let mut list = ctx.get(QueueKind::Graphics).unwrap();
        swapchain
            .begin_present_pass(&mut list, acquired.index, Vec4::new(0.0, 0.0, 1.0, 1.0))
            .unwrap();
        swapchain.end_present_pass(&mut list).unwrap();
        ctx.submit(list, false).unwrap();
        assert!(!swapchain.present(&ctx, acquired.index, &[]).unwrap());
        assert_eq!(soft.present_count(), 1);
        let image = swapchain.image(acquired.index).unwrap();
        assert_eq!(soft.image_bytes(image).unwrap()[..4], [255, 0, 0, 255]);

        instance.set_surface_extent(surface, 128, 48);
        assert!(swapchain
            .acquire_next_image(&ctx, vk::Semaphore::null())
            .unwrap()
            .is_none());
        let old_framebuffer = swapchain.framebuffer(0).unwrap();
        swapchain.resize(&ctx, 128, 48).unwrap();
        assert_eq!(swapchain.extent(), vk::Extent2D { width: 128, height: 48 });
        assert_eq!(
            swapchain.render_pass().unwrap().parent(),
            RenderPassParent::Swapchain
        );
        assert_eq!(swapchain.image_count(), 3);
        assert_ne!(swapchain.framebuffer(0).unwrap(), old_framebuffer);
        assert!(swapchain
            .acquire_next_image(&ctx, vk::Semaphore::null())
            .unwrap()
            .is_some());

        swapchain.destroy(&ctx);
        instance.destroy_surface(surface);
        ctx.shutdown().unwrap();
        assert!(soft.validation_errors().is_empty(), "{:?}", soft.validation_errors());
        assert_eq!(soft.live_objects(), 0);
    }
}
