//! Per-frame context for rendering.

use sge_gpu::{CommandList, Frame};

/// Context for the current frame being rendered.
pub struct FrameContext {
    frame: Frame,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
}

impl FrameContext {
    pub(crate) fn new(frame: Frame, dt: f32) -> Self {
        let frame_number = frame.number();
        Self {
            frame,
            dt,
            frame_number,
        }
    }

    /// The renderer frame, for [`sge_gpu::Renderer`] calls such as
    /// `begin_present_pass` and `draw`.
    pub fn frame(&mut self) -> &mut Frame {
        &mut self.frame
    }

    /// Graphics command list of this frame.
    pub fn list(&mut self) -> &mut CommandList {
        self.frame.list()
    }

    /// Index of the acquired swapchain image.
    pub fn image_index(&self) -> Option<u32> {
        self.frame.image_index()
    }

    pub(crate) fn into_frame(self) -> Frame {
        self.frame
    }
}
