//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be freed immediately
//! as they may still be in use by a previous frame. This module provides a queue
//! to defer deletions until the resource is guaranteed to no longer be in use.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::GpuBuffer;
use crate::context::GpuContext;
use crate::error::Result;
use crate::framebuffer::Framebuffer;
use crate::image::Image2D;
use crate::pipeline::Pipeline;
use crate::texture::Texture2D;

/// A resource handed over for destruction.
pub enum Retired {
    Buffer(GpuBuffer),
    Image(Image2D),
    Texture(Arc<Texture2D>),
    Framebuffer(Framebuffer),
    Pipeline(Pipeline),
}

impl Retired {
    fn destroy(self, ctx: &GpuContext) -> Result<()> {
        match self {
            Self::Buffer(mut buffer) => buffer.destroy(ctx),
            Self::Image(mut image) => image.destroy(ctx),
            Self::Texture(texture) => texture.destroy(ctx),
            Self::Framebuffer(mut framebuffer) => framebuffer.destroy(ctx),
            Self::Pipeline(mut pipeline) => {
                pipeline.destroy(ctx);
                Ok(())
            }
        }
    }
}

impl From<GpuBuffer> for Retired {
    fn from(buffer: GpuBuffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<Image2D> for Retired {
    fn from(image: Image2D) -> Self {
        Self::Image(image)
    }
}

impl From<Arc<Texture2D>> for Retired {
    fn from(texture: Arc<Texture2D>) -> Self {
        Self::Texture(texture)
    }
}

impl From<Framebuffer> for Retired {
    fn from(framebuffer: Framebuffer) -> Self {
        Self::Framebuffer(framebuffer)
    }
}

impl From<Pipeline> for Retired {
    fn from(pipeline: Pipeline) -> Self {
        Self::Pipeline(pipeline)
    }
}

struct PendingDeletion {
    resource: Retired,
    frame_queued: u64,
}

/// Queue for deferred deletions.
///
/// Resources are queued with a frame number and only destroyed once enough
/// frames have passed to guarantee they are no longer in use by any
/// in-flight frame.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Create a new deferred deletion queue.
    ///
    /// Resources are kept for `frames_in_flight` frames before being freed.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a resource retired during frame `frame_number`.
    pub fn queue(&mut self, resource: impl Into<Retired>, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource: resource.into(),
            frame_queued: frame_number,
        });
    }

    /// Destroy resources that are safe to delete at `current_frame_number`.
    ///
    /// Call this at the start of each frame.
    pub fn process(&mut self, ctx: &GpuContext, current_frame_number: u64) -> Result<()> {
        // Keep resources that were queued within the last `frames_in_flight` frames
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Queue order is FIFO and frame numbers are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|pending| pending.frame_queued < cutoff)
        {
            if let Some(pending) = self.pending.pop_front() {
                pending.resource.destroy(ctx)?;
            }
        }

        Ok(())
    }

    /// Destroy everything still pending.
    ///
    /// Call this during shutdown after the device went idle.
    pub fn flush(&mut self, ctx: &GpuContext) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            pending.resource.destroy(ctx)?;
        }
        Ok(())
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use gpu_allocator::MemoryLocation;

    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::context::GpuContextBuilder;

    fn buffer(ctx: &GpuContext, name: &str) -> GpuBuffer {
        GpuBuffer::new(
            ctx,
            16,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
            name,
        )
        .unwrap()
    }

    #[test]
    fn resources_live_for_frames_in_flight() {
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(Arc::new(SoftInstance::single()))
            .unwrap();
        let mut queue = DeferredDeletionQueue::new(2);
        queue.queue(buffer(&ctx, "a"), 0);
        queue.queue(buffer(&ctx, "b"), 1);

        queue.process(&ctx, 2).unwrap();
        assert_eq!(queue.pending_count(), 2);
        queue.process(&ctx, 3).unwrap();
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(ctx.allocator().lock().live_count(), 1);

        queue.flush(&ctx).unwrap();
        assert_eq!(queue.pending_count(), 0);
        ctx.shutdown().unwrap();
    }
}
