//! Renderer façade.
//!
//! Owns the GPU context, the swapchain and the frame loop. One renderer is
//! created per process; the scene and asset layers talk to it through
//! [`Renderer::context`], [`Renderer::draw`] and [`Renderer::retire`].

use std::sync::Arc;

use ash::vk;
use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::backend::{InstanceBackend, WindowHandles};
use crate::command::{CommandList, QueueKind, SubmitSync};
use crate::context::{GpuContext, GpuContextBuilder};
use crate::deferred::{DeferredDeletionQueue, Retired};
use crate::error::{GpuError, Result};
use crate::pipeline::DrawCall;
use crate::render_pass::RenderPass;
use crate::swapchain::Swapchain;
use crate::sync::FrameSync;

/// Renderer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    pub vsync: bool,
    pub frames_in_flight: usize,
    /// Prefer the GPU whose name contains this string.
    pub preferred_device: Option<String>,
    /// Initial surface size; the surface's own extent wins when it has one.
    pub width: u32,
    pub height: u32,
    /// RGBA clear color of the present pass.
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "SGE".to_string(),
            validation: cfg!(debug_assertions),
            vsync: true,
            frames_in_flight: 2,
            preferred_device: None,
            width: 1280,
            height: 720,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RendererConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frames recorded ahead of the GPU (at least one).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_preferred_device(mut self, name: impl Into<String>) -> Self {
        self.preferred_device = Some(name.into());
        self
    }

    pub fn with_clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color.to_array();
        self
    }

    pub fn clear_color(&self) -> Vec4 {
        Vec4::from_array(self.clear_color)
    }
}

/// One frame being recorded.
///
/// Handed out by [`Renderer::begin_frame`] and consumed by
/// [`Renderer::end_frame`].
pub struct Frame {
    list: CommandList,
    image_index: Option<u32>,
    number: u64,
}

impl Frame {
    /// Graphics command list of this frame.
    pub fn list(&mut self) -> &mut CommandList {
        &mut self.list
    }

    /// Acquired swapchain image, `None` when headless.
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    /// Frame counter value at `begin_frame`.
    pub fn number(&self) -> u64 {
        self.number
    }
}

/// The renderer.
pub struct Renderer {
    config: RendererConfig,
    deferred: DeferredDeletionQueue,
    sync: FrameSync,
    swapchain: Option<Swapchain>,
    surface: Option<vk::SurfaceKHR>,
    // Declared last so it outlives everything created from it.
    ctx: GpuContext,
    frame_number: u64,
    size: (u32, u32),
    needs_resize: bool,
    shut_down: bool,
}

impl Renderer {
    /// Create a renderer on the Vulkan backend presenting to `window`.
    pub fn init(config: RendererConfig, window: &dyn WindowHandles) -> Result<Self> {
        let instance: Arc<dyn InstanceBackend> = Arc::new(
            crate::backend::vulkan::VulkanInstance::new(&config.app_name, config.validation)?,
        );
        let surface = instance.create_surface(window)?;
        Self::init_with(instance, config, Some(surface))
    }

    /// Create a renderer on the Vulkan backend without a surface.
    pub fn headless(config: RendererConfig) -> Result<Self> {
        let instance = crate::backend::vulkan::VulkanInstance::new(
            &config.app_name,
            config.validation,
        )?;
        Self::init_with(Arc::new(instance), config, None)
    }

    /// Create a renderer on an existing instance backend.
    ///
    /// The renderer takes ownership of `surface` and destroys it at shutdown,
    /// also when construction fails.
    pub fn init_with(
        instance: Arc<dyn InstanceBackend>,
        config: RendererConfig,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<Self> {
        let built = GpuContextBuilder::new()
            .app_name(config.app_name.clone())
            .validation(config.validation)
            .headless(surface.is_none())
            .preferred_device(config.preferred_device.clone())
            .build_with(instance.clone());
        let mut ctx = match built {
            Ok(ctx) => ctx,
            Err(err) => {
                if let Some(surface) = surface {
                    instance.destroy_surface(surface);
                }
                return Err(err);
            }
        };

        let swapchain = match surface {
            Some(surface) => {
                match Swapchain::new(&ctx, surface, config.width, config.height, config.vsync) {
                    Ok(swapchain) => Some(swapchain),
                    Err(err) => {
                        instance.destroy_surface(surface);
                        ctx.shutdown()?;
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let image_count = swapchain.as_ref().map_or(0, Swapchain::image_count);
        let sync = FrameSync::new(&ctx, config.frames_in_flight, image_count)?;
        let deferred = DeferredDeletionQueue::new(sync.frames_in_flight());

        tracing::info!(
            "Renderer initialized: {} frames in flight, {}",
            sync.frames_in_flight(),
            if swapchain.is_some() { "windowed" } else { "headless" }
        );

        Ok(Self {
            size: (config.width, config.height),
            config,
            deferred,
            sync,
            swapchain,
            surface,
            ctx,
            frame_number: 0,
            needs_resize: false,
            shut_down: false,
        })
    }

    /// Start a frame.
    ///
    /// Waits for the frame slot's previous submission, frees resources
    /// retired long enough ago and acquires the next swapchain image.
    /// Returns `None` when the swapchain is out of date or the surface has
    /// no area; skip rendering and try again next frame.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self) -> Result<Option<Frame>> {
        if self.needs_resize && !self.recreate_swapchain()? {
            return Ok(None);
        }

        self.sync.wait_current(&self.ctx)?;
        self.deferred.process(&self.ctx, self.frame_number)?;

        let image_index = match &self.swapchain {
            Some(swapchain) => {
                match swapchain.acquire_next_image(&self.ctx, self.sync.image_available())? {
                    Some(acquired) => {
                        self.needs_resize |= acquired.suboptimal;
                        Some(acquired.index)
                    }
                    None => {
                        self.needs_resize = true;
                        return Ok(None);
                    }
                }
            }
            None => None,
        };

        let list = self.ctx.get(QueueKind::Graphics)?;
        Ok(Some(Frame {
            list,
            image_index,
            number: self.frame_number,
        }))
    }

    /// Begin the render pass drawing into the acquired swapchain image,
    /// cleared with the configured clear color.
    pub fn begin_present_pass(&self, frame: &mut Frame) -> Result<()> {
        let (swapchain, image_index) = self.present_target(frame)?;
        swapchain.begin_present_pass(&mut frame.list, image_index, self.config.clear_color())
    }

    pub fn end_present_pass(&self, frame: &mut Frame) -> Result<()> {
        let (swapchain, _) = self.present_target(frame)?;
        swapchain.end_present_pass(&mut frame.list)
    }

    fn present_target(&self, frame: &Frame) -> Result<(&Swapchain, u32)> {
        match (&self.swapchain, frame.image_index) {
            (Some(swapchain), Some(index)) => Ok((swapchain, index)),
            _ => Err(GpuError::InvalidState(
                "headless renderer has no present pass".to_string(),
            )),
        }
    }

    /// Record a draw call. Must be inside a render pass.
    pub fn draw(&self, frame: &mut Frame, call: &DrawCall<'_>) -> Result<()> {
        call.record(&mut frame.list)
    }

    /// Submit the frame and present it.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(&mut self, frame: Frame) -> Result<()> {
        let Frame {
            list, image_index, ..
        } = frame;

        match (&self.swapchain, image_index) {
            (Some(swapchain), Some(index)) => {
                let wait = [self.sync.image_available()];
                let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
                let signal = [self.sync.render_finished(index)];
                let submission = self.ctx.submit_with(
                    list,
                    &SubmitSync {
                        wait_semaphores: &wait,
                        wait_stages: &stages,
                        signal_semaphores: &signal,
                    },
                    false,
                )?;
                self.sync.set_in_flight(submission);
                if swapchain.present(&self.ctx, index, &signal)? {
                    self.needs_resize = true;
                }
            }
            _ => {
                let submission = self.ctx.submit(list, false)?;
                self.sync.set_in_flight(submission);
            }
        }

        self.sync.advance();
        self.frame_number += 1;
        Ok(())
    }

    /// Handle a window resize.
    ///
    /// A zero-sized window postpones the rebuild until it has an area again.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = (width, height);
        if self.swapchain.is_none() {
            return Ok(());
        }
        self.needs_resize = true;
        self.recreate_swapchain()?;
        Ok(())
    }

    /// Returns false while the surface has no area.
    fn recreate_swapchain(&mut self) -> Result<bool> {
        let (width, height) = self.size;
        let Some(swapchain) = &mut self.swapchain else {
            self.needs_resize = false;
            return Ok(true);
        };
        if width == 0 || height == 0 {
            return Ok(false);
        }

        swapchain.resize(&self.ctx, width, height)?;
        self.sync.set_image_count(&self.ctx, swapchain.image_count())?;
        self.needs_resize = false;
        Ok(true)
    }

    /// Hand a resource over for destruction once no frame in flight can
    /// still use it.
    pub fn retire(&mut self, resource: impl Into<Retired>) {
        self.deferred.queue(resource, self.frame_number);
    }

    /// Change the number of frames in flight.
    ///
    /// Waits for the device to go idle first.
    pub fn set_frames_in_flight(&mut self, frames: usize) -> Result<()> {
        let frames = frames.max(1);
        if frames == self.sync.frames_in_flight() {
            return Ok(());
        }
        self.ctx.wait_idle()?;
        let image_count = self.swapchain.as_ref().map_or(0, Swapchain::image_count);
        let sync = FrameSync::new(&self.ctx, frames, image_count)?;
        std::mem::replace(&mut self.sync, sync).destroy(&self.ctx);
        self.deferred.set_frames_in_flight(frames);
        self.config.frames_in_flight = frames;
        Ok(())
    }

    pub fn set_clear_color(&mut self, color: Vec4) {
        self.config.clear_color = color.to_array();
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// The render pass pipelines drawing to the screen are built against.
    pub fn present_render_pass(&self) -> Result<&RenderPass> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| {
                GpuError::InvalidState("headless renderer has no present pass".to_string())
            })?
            .render_pass()
    }

    /// Current drawable size.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.as_ref().map_or(
            vk::Extent2D {
                width: self.size.0,
                height: self.size.1,
            },
            Swapchain::extent,
        )
    }

    pub fn is_headless(&self) -> bool {
        self.swapchain.is_none()
    }

    /// Number of frames completed so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    /// Resources waiting for deferred destruction.
    pub fn pending_deletions(&self) -> usize {
        self.deferred.pending_count()
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.ctx.wait_idle()
    }

    /// Wait for the device and tear everything down in reverse creation
    /// order. Returns the allocator's leak check.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.ctx.wait_idle()?;

        self.deferred.flush(&self.ctx)?;
        self.sync.destroy(&self.ctx);
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.ctx);
        }
        if let Some(surface) = self.surface.take() {
            self.ctx.instance().destroy_surface(surface);
        }
        tracing::info!("Renderer shut down after {} frames", self.frame_number);
        self.ctx.shutdown()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::error!("Renderer shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use gpu_allocator::MemoryLocation;

    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::buffer::GpuBuffer;
    use crate::pipeline::{Pipeline, PipelineSpec, Shader};

    fn soft_config() -> RendererConfig {
        RendererConfig::new("renderer test")
            .with_validation(false)
            .with_size(32, 16)
            .with_clear_color(Vec4::new(0.0, 1.0, 0.0, 1.0))
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = soft_config().with_preferred_device("soft");
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: RendererConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(RendererConfig::new("x").with_frames_in_flight(0).frames_in_flight, 1);
    }

    #[test]
    fn headless_frames_free_retired_resources() {
        let instance = Arc::new(SoftInstance::single());
        let mut renderer = Renderer::init_with(instance.clone(), soft_config(), None).unwrap();
        assert!(renderer.is_headless());
        assert!(renderer.present_render_pass().is_err());

        let buffer = GpuBuffer::new(
            renderer.context(),
            64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
            "retired",
        )
        .unwrap();
        renderer.retire(buffer);

        let mut frame = renderer.begin_frame().unwrap().unwrap();
        assert_eq!(frame.image_index(), None);
        assert!(matches!(
            renderer.begin_present_pass(&mut frame),
            Err(GpuError::InvalidState(_))
        ));
        renderer.end_frame(frame).unwrap();

        for _ in 0..3 {
            let frame = renderer.begin_frame().unwrap().unwrap();
            renderer.end_frame(frame).unwrap();
        }
        assert_eq!(renderer.frame_number(), 4);
        assert_eq!(renderer.pending_deletions(), 0);
        assert_eq!(renderer.context().allocator().lock().live_count(), 0);

        renderer.shutdown().unwrap();
        assert_eq!(instance.device().unwrap().live_objects(), 0);
    }

    #[test]
    fn windowed_frames_draw_present_and_resize() {
        let instance = Arc::new(SoftInstance::single());
        let surface = instance.create_virtual_surface(32, 16);
        let mut renderer =
            Renderer::init_with(instance.clone(), soft_config(), Some(surface)).unwrap();
        let soft = instance.device().unwrap();
        let ctx = renderer.context();

        let mut shader = Shader::from_words(ctx, &[0x0723_0203], &[0x0723_0203]).unwrap();
        let spec = PipelineSpec::default()
            .attribute(vk::Format::R32G32_SFLOAT, 0)
            .stride(8);
        let pipeline = Pipeline::new(ctx, &shader, renderer.present_render_pass().unwrap(), &spec)
            .unwrap();
        shader.destroy(ctx);
        let vertices: [f32; 6] = [0.0, -0.5, 0.5, 0.5, -0.5, 0.5];
        let vertex_buffer = GpuBuffer::with_data(
            ctx,
            bytemuck::cast_slice(&vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "triangle",
        )
        .unwrap();

        let mut frame = renderer.begin_frame().unwrap().unwrap();
        let index = frame.image_index().unwrap();
        renderer.begin_present_pass(&mut frame).unwrap();
        renderer
            .draw(&mut frame, &DrawCall::new(&pipeline, &vertex_buffer, 3))
            .unwrap();
        renderer.end_present_pass(&mut frame).unwrap();
        renderer.end_frame(frame).unwrap();

        assert_eq!(soft.present_count(), 1);
        assert_eq!(soft.draw_count(), 1);
        let image = renderer.swapchain().unwrap().image(index).unwrap();
        assert_eq!(soft.image_bytes(image).unwrap()[..4], [0, 255, 0, 255]);

        instance.set_surface_extent(surface, 48, 48);
        assert!(renderer.begin_frame().unwrap().is_none());
        renderer.resize(48, 48).unwrap();
        assert_eq!(renderer.extent(), vk::Extent2D { width: 48, height: 48 });

        let mut frame = renderer.begin_frame().unwrap().unwrap();
        renderer.begin_present_pass(&mut frame).unwrap();
        renderer.end_present_pass(&mut frame).unwrap();
        renderer.end_frame(frame).unwrap();
        assert_eq!(soft.present_count(), 2);

        renderer.retire(pipeline);
        renderer.retire(vertex_buffer);
        renderer.shutdown().unwrap();
        assert!(soft.validation_errors().is_empty(), "{:?}", soft.validation_errors());
        assert_eq!(soft.live_objects(), 0);
        assert_eq!(instance.live_surfaces(), 0);
    }

    #[test]
    fn zero_sized_window_skips_frames() {
        let instance = Arc::new(SoftInstance::single());
        let surface = instance.create_virtual_surface(32, 16);
        let mut renderer =
            Renderer::init_with(instance.clone(), soft_config(), Some(surface)).unwrap();

        instance.set_surface_extent(surface, 0, 0);
        renderer.resize(0, 0).unwrap();
        assert!(renderer.begin_frame().unwrap().is_none());

        instance.set_surface_extent(surface, 20, 10);
        renderer.resize(20, 10).unwrap();
        let mut frame = renderer.begin_frame().unwrap().unwrap();
        renderer.begin_present_pass(&mut frame).unwrap();
        renderer.end_present_pass(&mut frame).unwrap();
        renderer.end_frame(frame).unwrap();
        assert_eq!(renderer.extent(), vk::Extent2D { width: 20, height: 10 });
        renderer.shutdown().unwrap();
    }
}
