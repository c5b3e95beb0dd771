//! Frame synchronization.
//!
//! Acquire semaphores are indexed by frame in flight, present semaphores by
//! swapchain image: an image's previous present may still be waiting on its
//! semaphore when a different frame slot renders to it again.

use ash::vk;

use crate::command::Submission;
use crate::context::GpuContext;
use crate::error::Result;

fn create_semaphores(ctx: &GpuContext, count: usize) -> Result<Vec<vk::Semaphore>> {
    (0..count).map(|_| ctx.device().create_semaphore()).collect()
}

/// Synchronization state for multiple frames in flight.
pub struct FrameSync {
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    in_flight: Vec<Option<Submission>>,
    current_frame: usize,
}

impl FrameSync {
    /// Create sync objects for `frames_in_flight` frames and `image_count`
    /// swapchain images (zero when headless).
    pub fn new(ctx: &GpuContext, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        Ok(Self {
            image_available: create_semaphores(ctx, frames_in_flight)?,
            render_finished: create_semaphores(ctx, image_count)?,
            in_flight: vec![None; frames_in_flight],
            current_frame: 0,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Index of the current frame slot.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Block until the current slot's previous submission has executed.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_current(&mut self, ctx: &GpuContext) -> Result<()> {
        if let Some(submission) = self.in_flight[self.current_frame].take() {
            ctx.wait(&submission)?;
        }
        Ok(())
    }

    /// Semaphore the current frame's acquire signals.
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available[self.current_frame]
    }

    /// Semaphore presentation of `image_index` waits on.
    pub fn render_finished(&self, image_index: u32) -> vk::Semaphore {
        self.render_finished
            .get(image_index as usize)
            .copied()
            .unwrap_or_else(vk::Semaphore::null)
    }

    /// Record the submission that uses the current slot.
    pub fn set_in_flight(&mut self, submission: Submission) {
        self.in_flight[self.current_frame] = Some(submission);
    }

    /// Move to the next frame slot.
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.in_flight.len();
    }

    /// Recreate the per-image semaphores after the swapchain changed its
    /// image count. The device must be idle.
    pub fn set_image_count(&mut self, ctx: &GpuContext, image_count: usize) -> Result<()> {
        if image_count == self.render_finished.len() {
            return Ok(());
        }
        for semaphore in self.render_finished.drain(..) {
            ctx.device().destroy_semaphore(semaphore);
        }
        self.render_finished = create_semaphores(ctx, image_count)?;
        Ok(())
    }

    /// Destroy all semaphores. The device must be idle.
    pub fn destroy(&mut self, ctx: &GpuContext) {
        for semaphore in self.image_available.drain(..).chain(self.render_finished.drain(..)) {
            ctx.device().destroy_semaphore(semaphore);
        }
        self.in_flight.iter_mut().for_each(|slot| *slot = None);
    }
}
