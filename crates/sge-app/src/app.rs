//! The [`SgeApp`] trait.

use winit::event::{DeviceEvent, DeviceId, WindowEvent};

use crate::context::AppContext;
use crate::frame::FrameContext;

/// An application driven by [`run_app`](crate::run_app).
///
/// The runner owns the window, the event loop and the renderer frame loop.
/// Per frame it calls [`update`](Self::update), then opens a renderer frame,
/// passes it to [`render`](Self::render) and submits and presents it.
pub trait SgeApp: Sized {
    /// Build the application once the window and renderer exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Advance state by `dt` seconds.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record this frame's work.
    ///
    /// The swapchain image is acquired and the frame's graphics list is
    /// recording. Skipped while the window is minimized.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// The window changed size and the swapchain has been rebuilt.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Window event hook. Returning `true` consumes the event.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Raw device input, such as mouse motion.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Release resources before the renderer shuts down.
    ///
    /// The device is idle. Anything handed to
    /// [`Renderer::retire`](sge_gpu::Renderer::retire) is destroyed by the
    /// renderer afterwards.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
