//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use sge_gpu::{Renderer, RendererConfig};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    // Dropped before the window, which backs the renderer's surface.
    renderer: Renderer,
    /// The window handle.
    pub window: Arc<Window>,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the renderer for `window`.
    pub(crate) fn new(window: Arc<Window>, config: RendererConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let config = config.with_size(size.width, size.height);
        let renderer = Renderer::init(config, window.as_ref())?;

        tracing::info!(
            "Renderer ready on {} ({}x{}, {} frames in flight)",
            renderer.context().physical_device().name(),
            renderer.extent().width,
            renderer.extent().height,
            renderer.frames_in_flight()
        );

        Ok(Self {
            renderer,
            window,
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.renderer.frames_in_flight()
    }

    /// Consume the context, tearing the renderer down before the window.
    pub(crate) fn shutdown(self) -> anyhow::Result<()> {
        let Self {
            renderer, window, ..
        } = self;
        renderer.shutdown()?;
        drop(window);
        Ok(())
    }
}
