//! GPU context management.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, InstanceBackend};
use crate::command::{CommandList, CommandQueue, QueueKind, SubmitSync, Submission};
use crate::device::{DeviceRequest, LogicalDevice, SWAPCHAIN_EXTENSION};
use crate::error::{GpuError, Result};
use crate::memory::GpuAllocator;
use crate::physical_device::{select_physical_device, PhysicalDevice};

/// Standard validation layer.
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Everything the renderer needs from the device, owned in one place.
///
/// Queues and the allocator sit behind mutexes, so the context can be shared
/// across threads even though the renderer drives it from one.
pub struct GpuContext {
    // Declared first so queues and allocator release before the instance.
    graphics: Mutex<CommandQueue>,
    transfer: Mutex<CommandQueue>,
    compute: Option<Mutex<CommandQueue>>,
    allocator: Mutex<GpuAllocator>,
    device: LogicalDevice,
    instance: Arc<dyn InstanceBackend>,
    shut_down: bool,
}

impl GpuContext {
    /// Device backend.
    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        self.device.backend()
    }

    /// Logical device and its configuration.
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.device
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        self.device.physical()
    }

    pub fn instance(&self) -> &Arc<dyn InstanceBackend> {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// The queue serving `kind`.
    ///
    /// Devices without a separate compute family serve compute work from the
    /// graphics queue.
    pub fn queue(&self, kind: QueueKind) -> &Mutex<CommandQueue> {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Transfer => &self.transfer,
            QueueKind::Compute => self.compute.as_ref().unwrap_or(&self.graphics),
        }
    }

    /// Check out a recording context from the queue serving `kind`.
    pub fn get(&self, kind: QueueKind) -> Result<CommandList> {
        self.queue(kind).lock().get()
    }

    /// Submit a list to the queue it came from.
    pub fn submit(&self, list: CommandList, wait: bool) -> Result<Submission> {
        self.queue(list.kind()).lock().submit(list, wait)
    }

    /// Submit a list with explicit semaphore synchronization.
    pub fn submit_with(
        &self,
        list: CommandList,
        sync: &SubmitSync<'_>,
        wait: bool,
    ) -> Result<Submission> {
        self.queue(list.kind()).lock().submit_with(list, sync, wait)
    }

    /// Block until an earlier submission has executed.
    pub fn wait(&self, submission: &Submission) -> Result<()> {
        self.queue(submission.kind()).lock().wait(submission)
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics.lock().family()
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer.lock().family()
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.queue(QueueKind::Compute).lock().family()
    }

    /// Distinct families the queues run on. Resources touched by more than
    /// one of them are created with concurrent sharing.
    pub fn unique_queue_families(&self) -> Vec<u32> {
        let mut families = vec![
            self.graphics_queue_family(),
            self.transfer_queue_family(),
            self.compute_queue_family(),
        ];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Wait for device to be idle and reclaim every recording context.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device().wait_idle()?;
        self.graphics.lock().wait_idle()?;
        self.transfer.lock().wait_idle()?;
        if let Some(compute) = &self.compute {
            compute.lock().wait_idle()?;
        }
        Ok(())
    }

    /// Tear down queues and the allocator.
    ///
    /// Every resource must have been destroyed already; survivors are
    /// reported as [`GpuError::AllocationLeak`]. The device itself goes away
    /// once the last handle to the backend is dropped.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        // A failed wait leaves everything in place for another attempt.
        self.wait_idle()?;
        self.shut_down = true;

        if let Some(compute) = &self.compute {
            compute.lock().destroy()?;
        }
        self.transfer.lock().destroy()?;
        self.graphics.lock().destroy()?;
        self.allocator.lock().shutdown()?;
        tracing::info!("GPU context shut down");
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!("GPU context shutdown failed: {}", err);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    headless: bool,
    required_extensions: Vec<String>,
    optional_extensions: Vec<String>,
    preferred_device: Option<String>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "SGE".to_string(),
            enable_validation: cfg!(debug_assertions),
            headless: false,
            required_extensions: Vec::new(),
            optional_extensions: Vec::new(),
            preferred_device: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Skip presentation support; the swapchain extension is not required.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Require a device extension.
    pub fn require_extension(mut self, name: impl Into<String>) -> Self {
        self.required_extensions.push(name.into());
        self
    }

    /// Enable a device extension when available.
    pub fn optional_extension(mut self, name: impl Into<String>) -> Self {
        self.optional_extensions.push(name.into());
        self
    }

    /// Prefer the device whose name contains `name`.
    pub fn preferred_device(mut self, name: Option<String>) -> Self {
        self.preferred_device = name;
        self
    }

    /// Build the GPU context on the Vulkan backend.
    pub fn build(self) -> Result<GpuContext> {
        let instance =
            crate::backend::vulkan::VulkanInstance::new(&self.app_name, self.enable_validation)?;
        self.build_with(Arc::new(instance))
    }

    /// Build the GPU context on an already created instance backend.
    pub fn build_with(self, instance: Arc<dyn InstanceBackend>) -> Result<GpuContext> {
        let mut required = self.required_extensions;
        if !self.headless && !required.iter().any(|ext| ext == SWAPCHAIN_EXTENSION) {
            required.push(SWAPCHAIN_EXTENSION.to_string());
        }

        let devices = PhysicalDevice::enumerate(&*instance)?;
        let physical =
            select_physical_device(&devices, &required, self.preferred_device.as_deref())?;
        tracing::info!("Selected GPU: {}", physical.summary());

        let request = DeviceRequest {
            queue_flags: vk::QueueFlags::GRAPHICS,
            required_extensions: required,
            optional_extensions: self.optional_extensions,
            layers: if self.enable_validation {
                vec![VALIDATION_LAYER.to_string()]
            } else {
                Vec::new()
            },
        };
        let device = LogicalDevice::create(&*instance, physical, &request)?;

        let families = device.queue_families();
        let graphics_family = families.graphics.ok_or(GpuError::NoSuitableDevice)?;
        let transfer_family = families.transfer.unwrap_or(graphics_family);
        let backend = device.backend().clone();
        let physical = device.physical();

        let graphics = CommandQueue::new(
            backend.clone(),
            QueueKind::Graphics,
            graphics_family,
            physical.family_flags(graphics_family),
        )?;
        let transfer = CommandQueue::new(
            backend.clone(),
            QueueKind::Transfer,
            transfer_family,
            physical.family_flags(transfer_family),
        )?;
        let compute = match families.compute {
            Some(family) if family != graphics_family => Some(Mutex::new(CommandQueue::new(
                backend.clone(),
                QueueKind::Compute,
                family,
                physical.family_flags(family),
            )?)),
            _ => None,
        };

        Ok(GpuContext {
            graphics: Mutex::new(graphics),
            transfer: Mutex::new(transfer),
            compute,
            allocator: Mutex::new(GpuAllocator::new(backend)),
            device,
            instance,
            shut_down: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftAdapter, SoftInstance};

    #[test]
    fn builds_on_combined_family() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new()
            .validation(false)
            .build_with(instance.clone())
            .unwrap();
        assert_eq!(ctx.unique_queue_families(), vec![0]);
        assert_eq!(ctx.compute_queue_family(), 0);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn uses_separate_transfer_family() {
        let instance = Arc::new(SoftInstance::new(vec![SoftAdapter::new("gpu")
            .with_queue_families(vec![vk::QueueFlags::GRAPHICS, vk::QueueFlags::TRANSFER])]));
        let mut ctx = GpuContextBuilder::new()
            .validation(false)
            .build_with(instance)
            .unwrap();
        assert_eq!(ctx.graphics_queue_family(), 0);
        assert_eq!(ctx.transfer_queue_family(), 1);
        assert_eq!(ctx.unique_queue_families(), vec![0, 1]);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn no_devices_is_an_error() {
        let instance = Arc::new(SoftInstance::new(Vec::new()));
        let result = GpuContextBuilder::new().build_with(instance);
        assert!(matches!(result, Err(GpuError::NoSuitableDevice)));
    }

    #[test]
    fn headless_does_not_need_swapchain() {
        let instance = Arc::new(SoftInstance::new(vec![SoftAdapter::new("bare").with_extensions(&[])]));
        assert!(GpuContextBuilder::new().build_with(instance.clone()).is_err());
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance)
            .unwrap();
        assert!(!ctx.logical_device().is_extension_enabled(SWAPCHAIN_EXTENSION));
        ctx.shutdown().unwrap();
    }

    #[test]
    fn failed_shutdown_can_be_retried() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        let soft = instance.device().unwrap();
        let list = ctx.get(QueueKind::Graphics).unwrap();
        ctx.submit(list, false).unwrap();

        soft.set_lost(true);
        assert!(matches!(
            ctx.shutdown(),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert!(soft.live_objects() > 0);

        soft.set_lost(false);
        ctx.shutdown().unwrap();
        assert_eq!(soft.live_objects(), 0);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn submit_routes_by_list_kind() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new()
            .build_with(instance.clone())
            .unwrap();
        let list = ctx.get(QueueKind::Transfer).unwrap();
        let ticket = ctx.submit(list, false).unwrap();
        assert_eq!(ticket.kind(), QueueKind::Transfer);
        assert_eq!(ctx.queue(QueueKind::Transfer).lock().in_flight_count(), 1);
        ctx.wait(&ticket).unwrap();
        assert_eq!(ctx.queue(QueueKind::Transfer).lock().free_count(), 1);
        ctx.shutdown().unwrap();
        assert!(instance.device().unwrap().validation_errors().is_empty());
    }
}
