//! Renderer core of the SGE engine.
//!
//! This crate provides:
//! - Physical device selection and logical device creation
//! - Memory allocation via gpu-allocator
//! - Command queues with pooled, fence-tracked recording contexts
//! - Images, buffers and textures with explicit layout tracking
//! - Render passes, framebuffers and the swapchain
//! - Graphics pipelines and the [`Renderer`] frame loop
//!
//! Everything talks to the graphics API through the [`backend`] traits. The
//! Vulkan backend is always compiled; the software backend is available for
//! tests and with the `soft` feature.

pub mod backend;
pub mod buffer;
pub mod command;
pub mod context;
pub mod deferred;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod image;
pub mod memory;
pub mod physical_device;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use backend::vulkan::{VulkanDevice, VulkanInstance};
pub use backend::{DeviceBackend, InstanceBackend, WindowHandles};
pub use buffer::GpuBuffer;
pub use command::{CommandList, CommandQueue, QueueKind, SubmitSync, Submission};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{DeferredDeletionQueue, Retired};
pub use device::{DeviceFeatures, DeviceRequest, LogicalDevice};
pub use error::{GpuError, Result};
pub use framebuffer::{Framebuffer, FramebufferSpec};
pub use crate::image::{Image2D, ImageId, LayoutObserver};
pub use memory::{Allocation, AllocatorStats, GpuAllocator};
pub use physical_device::{GpuVendor, PhysicalDevice, QueueFamilyIndices};
pub use pipeline::{DrawCall, Pipeline, PipelineSpec, Shader};
pub use render_pass::{RenderPass, RenderPassParent};
pub use renderer::{Frame, Renderer, RendererConfig};
pub use swapchain::Swapchain;
pub use sync::FrameSync;
pub use texture::Texture2D;

// Re-export the value types shared with the asset layer.
pub use sge_core::{ImageFormat, ImageSpec, ImageUsage, TextureFilter, TextureSettings, TextureWrap};
