//! Command queues and recording contexts.
//!
//! A [`CommandQueue`] owns one hardware queue and a pool of recording
//! contexts, each a command buffer paired with a completion fence. A context
//! moves through `free -> recording -> in flight -> free`:
//!
//! - [`CommandQueue::get`] hands out a [`CommandList`] in the recording state,
//!   reclaiming contexts whose fences have signaled and growing the pool when
//!   none is free.
//! - [`CommandQueue::submit`] ends recording and enqueues the context. The
//!   context is only reused once its fence has signaled.
//!
//! A list dropped without being submitted returns its context to the pool
//! unused. The pool never shrinks.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, ImageBarrier, RenderPassBegin, SubmitDesc};
use crate::error::{GpuError, Result};

/// Which hardware queue a command queue drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// Ticket for one submission, used to wait for it later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Submission {
    kind: QueueKind,
    serial: u64,
}

impl Submission {
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Position of the submission in its queue's order.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// Semaphores a submission waits on and signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitSync<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Clone, Copy, Debug)]
struct Context {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Contexts handed back by dropped lists, drained on the next `get`.
#[derive(Debug, Default)]
struct Returns {
    contexts: Vec<Context>,
    closed: bool,
}

#[derive(Clone, Copy, Debug)]
struct ActivePass {
    extent: vk::Extent2D,
}

/// A recording context checked out of a [`CommandQueue`].
///
/// Hand it back through [`CommandQueue::submit`]. Dropping it discards the
/// recorded commands and returns the context to its queue.
pub struct CommandList {
    device: Arc<dyn DeviceBackend>,
    returns: Arc<Mutex<Returns>>,
    kind: QueueKind,
    family_flags: vk::QueueFlags,
    context: Option<Context>,
    render_pass: Option<ActivePass>,
    pipeline_layout: Option<vk::PipelineLayout>,
}

impl CommandList {
    fn context(&self) -> Context {
        // Only `CommandQueue::submit` takes the context, and it consumes the list.
        self.context.unwrap_or(Context {
            cmd: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
        })
    }

    /// Raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.context().cmd
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Capabilities of the queue family this list records for.
    pub fn family_flags(&self) -> vk::QueueFlags {
        self.family_flags
    }

    /// Returns true if graphics commands may be recorded.
    pub fn supports_graphics(&self) -> bool {
        self.family_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    /// Returns true between a render pass begin and its end.
    pub fn is_in_render_pass(&self) -> bool {
        self.render_pass.is_some()
    }

    /// Extent of the active render pass.
    pub fn render_area(&self) -> Option<vk::Extent2D> {
        self.render_pass.map(|pass| pass.extent)
    }

    pub fn image_barrier(&mut self, barrier: &ImageBarrier) {
        self.device.cmd_image_barrier(self.handle(), barrier);
    }

    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        self.device.cmd_copy_buffer(self.handle(), src, dst, region);
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        self.device
            .cmd_copy_buffer_to_image(self.handle(), src, dst, layout, region);
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    ) {
        self.device
            .cmd_copy_image_to_buffer(self.handle(), src, layout, dst, region);
    }

    /// Begin a render pass.
    ///
    /// Fails with [`GpuError::InvalidState`] if a pass is already active or the
    /// queue cannot do graphics.
    pub fn begin_render_pass(&mut self, begin: &RenderPassBegin) -> Result<()> {
        if self.render_pass.is_some() {
            return Err(GpuError::InvalidState(
                "render pass begun while another is active".to_string(),
            ));
        }
        if !self.supports_graphics() {
            return Err(GpuError::InvalidState(format!(
                "render pass recorded on a {:?} queue",
                self.kind
            )));
        }
        self.device.cmd_begin_render_pass(self.handle(), begin);
        self.device.cmd_set_viewport(self.handle(), begin.extent);
        self.render_pass = Some(ActivePass {
            extent: begin.extent,
        });
        Ok(())
    }

    /// End the active render pass.
    pub fn end_render_pass(&mut self) -> Result<()> {
        if self.render_pass.take().is_none() {
            return Err(GpuError::InvalidState(
                "render pass ended while none is active".to_string(),
            ));
        }
        self.pipeline_layout = None;
        self.device.cmd_end_render_pass(self.handle());
        Ok(())
    }

    fn require_render_pass(&self, what: &str) -> Result<()> {
        if self.render_pass.is_none() {
            return Err(GpuError::InvalidState(format!("{what} outside a render pass")));
        }
        Ok(())
    }

    /// Bind a graphics pipeline. Must be inside a render pass.
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> Result<()> {
        self.require_render_pass("pipeline bound")?;
        self.device.cmd_bind_pipeline(self.handle(), pipeline);
        self.pipeline_layout = Some(layout);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.device.cmd_bind_vertex_buffer(self.handle(), buffer, offset);
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.device.cmd_bind_index_buffer(self.handle(), buffer, offset);
    }

    /// Push constants to the bound pipeline's layout.
    pub fn push_constants(&mut self, data: &[u8]) -> Result<()> {
        let layout = self.pipeline_layout.ok_or_else(|| {
            GpuError::InvalidState("push constants without a bound pipeline".to_string())
        })?;
        self.device.cmd_push_constants(self.handle(), layout, data);
        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.require_render_pass("draw")?;
        self.device
            .cmd_draw(self.handle(), vertex_count, instance_count);
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> Result<()> {
        self.require_render_pass("indexed draw")?;
        self.device
            .cmd_draw_indexed(self.handle(), index_count, instance_count);
        Ok(())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            tracing::warn!("{:?} command list dropped without being submitted", self.kind);
            let mut returns = self.returns.lock();
            if returns.closed {
                // The pool and its command buffers are already gone.
                self.device.destroy_fence(context.fence);
            } else {
                returns.contexts.push(context);
            }
        }
    }
}

/// A hardware queue plus its pool of recording contexts.
pub struct CommandQueue {
    device: Arc<dyn DeviceBackend>,
    kind: QueueKind,
    family: u32,
    family_flags: vk::QueueFlags,
    queue: vk::Queue,
    pool: vk::CommandPool,
    free: Vec<Context>,
    in_flight: VecDeque<(u64, Context)>,
    returns: Arc<Mutex<Returns>>,
    created: usize,
    next_serial: u64,
}

impl CommandQueue {
    /// Create a queue driving the first queue of `family`.
    pub fn new(
        device: Arc<dyn DeviceBackend>,
        kind: QueueKind,
        family: u32,
        family_flags: vk::QueueFlags,
    ) -> Result<Self> {
        let pool = device.create_command_pool(family)?;
        let queue = device.get_queue(family);
        tracing::debug!("{:?} queue on family {} ({:?})", kind, family, family_flags);
        Ok(Self {
            device,
            kind,
            family,
            family_flags,
            queue,
            pool,
            free: Vec::new(),
            in_flight: VecDeque::new(),
            returns: Arc::default(),
            created: 0,
            next_serial: 0,
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn family_flags(&self) -> vk::QueueFlags {
        self.family_flags
    }

    /// Raw queue handle.
    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    /// Move every in-flight context whose fence has signaled back to the
    /// free list.
    fn reclaim(&mut self) -> Result<()> {
        self.free.append(&mut self.returns.lock().contexts);
        let mut still_running = VecDeque::with_capacity(self.in_flight.len());
        while let Some((serial, context)) = self.in_flight.pop_front() {
            if self.device.fence_signaled(context.fence)? {
                self.device.reset_fence(context.fence)?;
                self.free.push(context);
            } else {
                still_running.push_back((serial, context));
            }
        }
        self.in_flight = still_running;
        Ok(())
    }

    /// Check out a context in the recording state.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn get(&mut self) -> Result<CommandList> {
        if self.pool == vk::CommandPool::null() {
            return Err(GpuError::InvalidState(format!(
                "{:?} queue used after destroy",
                self.kind
            )));
        }
        self.reclaim()?;

        let context = match self.free.pop() {
            Some(context) => context,
            None => {
                let context = Context {
                    cmd: self.device.allocate_command_buffer(self.pool)?,
                    fence: self.device.create_fence(false)?,
                };
                self.created += 1;
                tracing::debug!(
                    "{:?} command pool grew to {} context(s)",
                    self.kind,
                    self.created
                );
                context
            }
        };
        if let Err(err) = self.device.begin_command_buffer(context.cmd) {
            self.free.push(context);
            return Err(err);
        }

        Ok(CommandList {
            device: self.device.clone(),
            returns: self.returns.clone(),
            kind: self.kind,
            family_flags: self.family_flags,
            context: Some(context),
            render_pass: None,
            pipeline_layout: None,
        })
    }

    /// Submit a list, optionally blocking until it has executed.
    pub fn submit(&mut self, list: CommandList, wait: bool) -> Result<Submission> {
        self.submit_with(list, &SubmitSync::default(), wait)
    }

    /// Submit a list with explicit semaphore synchronization.
    ///
    /// # Panics
    /// Panics if the list was checked out of a different queue kind or still
    /// has a render pass open.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit_with(
        &mut self,
        mut list: CommandList,
        sync: &SubmitSync<'_>,
        wait: bool,
    ) -> Result<Submission> {
        assert_eq!(
            list.kind, self.kind,
            "command list submitted to the wrong queue"
        );
        assert!(
            list.render_pass.is_none(),
            "command list submitted with an open render pass"
        );
        let Some(context) = list.context.take() else {
            return Err(GpuError::InvalidState(
                "command list has no recording context".to_string(),
            ));
        };

        if let Err(err) = self.device.end_command_buffer(context.cmd) {
            self.free.push(context);
            return Err(err);
        }
        let submit = SubmitDesc {
            command_buffer: context.cmd,
            wait_semaphores: sync.wait_semaphores,
            wait_stages: sync.wait_stages,
            signal_semaphores: sync.signal_semaphores,
        };
        if let Err(err) = self.device.queue_submit(self.queue, &submit, context.fence) {
            self.free.push(context);
            return Err(err);
        }

        let serial = self.next_serial;
        self.next_serial += 1;

        // In flight until its fence is seen signaled, so a failed wait
        // leaves it for the next reclaim.
        self.in_flight.push_back((serial, context));
        let submission = Submission {
            kind: self.kind,
            serial,
        };
        if wait {
            self.wait(&submission)?;
        }
        Ok(submission)
    }

    /// Block until an earlier submission has executed.
    pub fn wait(&mut self, submission: &Submission) -> Result<()> {
        assert_eq!(
            submission.kind, self.kind,
            "submission waited on through the wrong queue"
        );
        let Some(position) = self
            .in_flight
            .iter()
            .position(|(serial, _)| *serial == submission.serial)
        else {
            // Already reclaimed, so its fence has signaled.
            return Ok(());
        };
        let context = self.in_flight[position].1;
        self.device.wait_for_fence(context.fence)?;
        self.reclaim()
    }

    /// Block until every in-flight submission has executed.
    pub fn wait_idle(&mut self) -> Result<()> {
        for (_, context) in &self.in_flight {
            self.device.wait_for_fence(context.fence)?;
        }
        self.reclaim()
    }

    /// Contexts ready to be handed out.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Contexts submitted but not yet reclaimed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Total contexts ever created by this queue.
    pub fn len(&self) -> usize {
        self.created
    }

    pub fn is_empty(&self) -> bool {
        self.created == 0
    }

    /// Wait for all work and release the pool.
    ///
    /// Lists still checked out lose their command buffers; their fences are
    /// released when they are dropped. Later calls to [`get`](Self::get) fail.
    pub fn destroy(&mut self) -> Result<()> {
        self.wait_idle()?;
        self.returns.lock().closed = true;
        let outstanding = self.created - self.free.len();
        if outstanding > 0 {
            tracing::warn!(
                "{:?} queue destroyed with {} command list(s) checked out",
                self.kind,
                outstanding
            );
        }
        for context in self.free.drain(..) {
            self.device.destroy_fence(context.fence);
        }
        self.created = outstanding;
        if self.pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.pool);
            self.pool = vk::CommandPool::null();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftInstance;

    fn queue(instance: &SoftInstance) -> CommandQueue {
        let device = instance.create_default_device();
        CommandQueue::new(
            device,
            QueueKind::Graphics,
            0,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
        )
        .unwrap()
    }

    #[test]
    fn waiting_submit_returns_context_to_pool() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);

        let list = queue.get().unwrap();
        queue.submit(list, true).unwrap();
        assert_eq!(queue.free_count(), 1);
        assert_eq!(queue.in_flight_count(), 0);

        // The same context is reused.
        let list = queue.get().unwrap();
        queue.submit(list, true).unwrap();
        assert_eq!(queue.len(), 1);
        queue.destroy().unwrap();
        assert!(instance.device().unwrap().validation_errors().is_empty());
    }

    #[test]
    fn free_count_tracks_signaled_fences() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let soft = instance.device().unwrap();

        for _ in 0..4 {
            let list = queue.get().unwrap();
            queue.submit(list, false).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.in_flight_count(), 4);

        assert_eq!(soft.complete(3), 3);
        let list = queue.get().unwrap();
        // Three fences signaled, one of those contexts handed out again.
        assert_eq!(queue.free_count(), 2);
        assert_eq!(queue.in_flight_count(), 1);
        assert_eq!(queue.len(), 4);

        queue.submit(list, false).unwrap();
        queue.destroy().unwrap();
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn pool_grows_while_contexts_are_in_flight() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let soft = instance.device().unwrap();

        let mut tickets = Vec::new();
        for _ in 0..3 {
            let list = queue.get().unwrap();
            tickets.push(queue.submit(list, false).unwrap());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.free_count(), 0);

        queue.wait(&tickets[1]).unwrap();
        assert_eq!(queue.free_count(), 2);
        assert_eq!(queue.in_flight_count(), 1);

        // Waiting again on a reclaimed submission is a no-op.
        queue.wait(&tickets[0]).unwrap();
        queue.wait_idle().unwrap();
        assert_eq!(queue.free_count(), 3);
        assert_eq!(soft.pending_submissions(), 0);
        // No context was ever re-recorded while its fence was pending.
        assert!(soft.validation_errors().is_empty());
        queue.destroy().unwrap();
    }

    #[test]
    fn serials_follow_submission_order() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let list = queue.get().unwrap();
        let first = queue.submit(list, false).unwrap();
        let list = queue.get().unwrap();
        let second = queue.submit(list, true).unwrap();
        assert!(first.serial() < second.serial());
        assert_eq!(first.kind(), QueueKind::Graphics);
        queue.destroy().unwrap();
    }

    #[test]
    fn render_pass_nesting_is_rejected() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let mut list = queue.get().unwrap();
        let begin = RenderPassBegin {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            clear_color: [0.0; 4],
            color_attachments: 1,
            has_depth: false,
        };

        assert!(matches!(list.end_render_pass(), Err(GpuError::InvalidState(_))));
        list.begin_render_pass(&begin).unwrap();
        assert!(matches!(list.begin_render_pass(&begin), Err(GpuError::InvalidState(_))));
        assert!(matches!(list.push_constants(&[0; 4]), Err(GpuError::InvalidState(_))));
        list.end_render_pass().unwrap();
        assert!(matches!(list.draw(3, 1), Err(GpuError::InvalidState(_))));
        queue.submit(list, false).unwrap();
        queue.destroy().unwrap();
    }

    #[test]
    fn transfer_lists_cannot_render() {
        let instance = SoftInstance::single();
        let device = instance.create_default_device();
        let mut queue =
            CommandQueue::new(device, QueueKind::Transfer, 0, vk::QueueFlags::TRANSFER).unwrap();
        let mut list = queue.get().unwrap();
        let begin = RenderPassBegin {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            extent: vk::Extent2D::default(),
            clear_color: [0.0; 4],
            color_attachments: 1,
            has_depth: false,
        };
        assert!(list.begin_render_pass(&begin).is_err());
        queue.submit(list, true).unwrap();
        queue.destroy().unwrap();
    }

    #[test]
    fn dropped_list_returns_its_context() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let soft = instance.device().unwrap();

        for _ in 0..5 {
            let mut list = queue.get().unwrap();
            list.copy_buffer(vk::Buffer::null(), vk::Buffer::null(), vk::BufferCopy::default());
            drop(list);
        }
        assert_eq!(queue.len(), 1);

        let list = queue.get().unwrap();
        queue.submit(list, true).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.free_count(), 1);
        queue.destroy().unwrap();
        assert_eq!(soft.live_objects(), 0);
    }

    #[test]
    fn list_outliving_its_queue_releases_the_fence() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let soft = instance.device().unwrap();

        let list = queue.get().unwrap();
        queue.destroy().unwrap();
        drop(list);
        assert_eq!(soft.live_objects(), 0);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn get_after_destroy_fails() {
        let instance = SoftInstance::single();
        let mut queue = queue(&instance);
        let list = queue.get().unwrap();
        queue.submit(list, true).unwrap();
        queue.destroy().unwrap();
        assert!(matches!(queue.get(), Err(GpuError::InvalidState(_))));
        // Destroying twice is harmless.
        queue.destroy().unwrap();
    }

    #[test]
    #[should_panic(expected = "wrong queue")]
    fn submitting_to_the_wrong_queue_panics() {
        let instance = SoftInstance::single();
        let device = instance.create_default_device();
        let mut graphics =
            CommandQueue::new(device.clone(), QueueKind::Graphics, 0, vk::QueueFlags::GRAPHICS)
                .unwrap();
        let mut transfer =
            CommandQueue::new(device, QueueKind::Transfer, 0, vk::QueueFlags::TRANSFER).unwrap();
        let list = transfer.get().unwrap();
        let _ = graphics.submit(list, false);
    }
}
