//! Graphics API seam.
//!
//! Every component of the renderer core talks to the graphics API through the
//! two traits in this module. One production implementation is compiled in
//! ([`vulkan`]); the software implementation in [`soft`] emulates the same
//! contract on the CPU and is only built for tests or with the `soft` feature.
//!
//! The traits speak in Vulkan handle and enum types (`ash::vk`) so the
//! production backend is a thin translation layer, but they never expose
//! `ash` loaders or builder structs with borrowed pointer chains.

use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::device::DeviceCreateDesc;
use crate::error::Result;
use crate::physical_device::PhysicalDevice;

#[cfg(any(test, feature = "soft"))]
pub mod soft;
pub mod vulkan;

/// A window the instance can create a presentation surface for.
pub trait WindowHandles: HasDisplayHandle + HasWindowHandle {}

impl<T: HasDisplayHandle + HasWindowHandle> WindowHandles for T {}

/// Identifier of one backing memory allocation inside a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// Memory bound to a freshly created buffer or image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub id: AllocationId,
    /// Size the device actually reserved, which may exceed the requested size.
    pub size: u64,
}

/// Buffer creation request.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

/// 2D image creation request.
///
/// When more than one queue family is listed the image is created with
/// concurrent sharing across them.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub queue_families: &'a [u32],
}

/// Image view creation request covering every mip level and layer.
#[derive(Clone, Copy, Debug)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
}

/// Sampler creation request.
#[derive(Clone, Copy, Debug)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

/// One image memory barrier together with its stage masks.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub range: vk::ImageSubresourceRange,
}

/// Queue submission of a single command buffer.
#[derive(Clone, Copy, Debug)]
pub struct SubmitDesc<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// One render pass attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub final_layout: vk::ImageLayout,
}

/// Single-subpass render pass layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub color: Vec<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
}

/// Framebuffer creation request. Attachments are color views first, then depth.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub attachments: &'a [vk::ImageView],
    pub extent: vk::Extent2D,
}

/// Arguments of a render pass begin command.
#[derive(Clone, Copy, Debug)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub color_attachments: u32,
    pub has_depth: bool,
}

/// Vertex attribute inside the single vertex binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Graphics pipeline creation request.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub render_pass: vk::RenderPass,
    pub color_attachments: u32,
    pub vertex_stride: u32,
    pub vertex_attributes: &'a [VertexAttribute],
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: bool,
    pub push_constant_size: u32,
}

/// Swapchain creation request.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc<'a> {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub queue_families: &'a [u32],
    pub old_swapchain: vk::SwapchainKHR,
}

/// Surface capabilities query result.
#[derive(Clone, Debug)]
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Result of a successful swapchain image acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// Instance-level entry point of a backend.
pub trait InstanceBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Enumerate the physical devices visible to this instance.
    ///
    /// Zero devices is an empty list, not an error.
    fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>>;

    /// Create the logical device described by `desc`.
    fn create_device(
        &self,
        physical: &PhysicalDevice,
        desc: &DeviceCreateDesc,
    ) -> Result<Arc<dyn DeviceBackend>>;

    /// Create a presentation surface for a window.
    fn create_surface(&self, window: &dyn WindowHandles) -> Result<vk::SurfaceKHR>;

    /// Destroy a presentation surface. Its swapchain must be destroyed first.
    fn destroy_surface(&self, surface: vk::SurfaceKHR);
}

/// Device-level operations used by the renderer core.
///
/// Handles passed in must have been created by the same device. Commands
/// (`cmd_*`) are recorded into a command buffer that is between
/// `begin_command_buffer` and `end_command_buffer`.
pub trait DeviceBackend: Send + Sync {
    /// Returns true if the device resolves the named device-level function.
    fn has_function(&self, name: &CStr) -> bool;

    /// Get the first queue of a family.
    fn get_queue(&self, family: u32) -> vk::Queue;

    /// Block until every queue of the device is idle.
    fn wait_idle(&self) -> Result<()>;

    // Memory

    /// Create a buffer and bind freshly allocated memory to it.
    fn create_buffer(
        &self,
        desc: &BufferDesc<'_>,
        location: MemoryLocation,
    ) -> Result<(vk::Buffer, MemoryBlock)>;

    /// Destroy a buffer and release its memory.
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) -> Result<()>;

    /// Create an image and bind freshly allocated memory to it.
    fn create_image(
        &self,
        desc: &ImageDesc<'_>,
        location: MemoryLocation,
    ) -> Result<(vk::Image, MemoryBlock)>;

    /// Destroy an image and release its memory.
    fn destroy_image(&self, image: vk::Image, allocation: AllocationId) -> Result<()>;

    /// Host pointer of a host-visible allocation.
    fn mapped_ptr(&self, allocation: AllocationId) -> Option<NonNull<u8>>;

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Command recording

    /// Create a command pool whose buffers can be reset individually.
    fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;

    /// Reset and begin a one-time-submit recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier);
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    );
    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    );
    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// Set viewport and scissor to cover `extent`.
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64);

    /// Bind a buffer of 32-bit indices.
    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64);
    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]);
    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32);

    // Synchronization

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);

    /// Non-blocking fence status query.
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;

    /// Block without timeout until the fence signals.
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submit one command buffer, signalling `fence` on completion.
    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc<'_>, fence: vk::Fence)
        -> Result<()>;

    // Pipelines and render passes

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout);

    // Presentation

    /// Returns true if the queue family can present to the surface.
    fn surface_support(&self, family: u32, surface: vk::SurfaceKHR) -> Result<bool>;
    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> Result<SurfaceCapabilities>;
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc<'_>,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquire the next presentable image.
    ///
    /// An out-of-date swapchain is reported as [`crate::GpuError::SwapchainOutOfDate`].
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<AcquiredImage>;

    /// Present an image. Returns true if the swapchain should be recreated.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool>;
}
