//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The graphics API could not be loaded.
    #[error("Failed to load graphics API: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// A device function could not be resolved even though its extension was enabled.
    #[error("Device function could not be resolved: {0}")]
    MissingFunction(String),

    /// Logical device creation failed.
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Allocations were still alive when the allocator shut down.
    #[error("{count} allocation(s) leaked: {names}")]
    AllocationLeak { count: usize, names: String },

    /// Host access requested for memory the host cannot see.
    #[error("Allocation is not host visible: {0}")]
    NotHostVisible(String),

    /// Layout missing from the transition table.
    #[error("Unimplemented/unsupported image layout: {0:?}")]
    UnsupportedLayout(vk::ImageLayout),

    /// Only mip level 0 can be uploaded in one call.
    #[error("Can't copy more than one mip level (image has {0})")]
    MultiMipCopy(u32),

    /// Image or buffer description rejected before reaching the device.
    #[error("Invalid resource description: {0}")]
    InvalidDescription(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches its surface.
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Asset data could not be turned into a GPU resource.
    #[error("Asset error: {0}")]
    Asset(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Returns true for errors after which the renderer cannot continue.
    ///
    /// Everything else is reported to the caller, which may skip the operation
    /// or substitute a default.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Loading(_)
                | Self::NoSuitableDevice
                | Self::ExtensionNotSupported(_)
                | Self::MissingFunction(_)
                | Self::DeviceCreation(_)
                | Self::AllocationLeak { .. }
                | Self::UnsupportedLayout(_)
                | Self::MultiMipCopy(_)
                | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

impl From<sge_core::Error> for GpuError {
    fn from(err: sge_core::Error) -> Self {
        Self::InvalidDescription(err.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(GpuError::MissingFunction("vkCreateSwapchainKHR".into()).is_fatal());
        assert!(GpuError::UnsupportedLayout(vk::ImageLayout::PRESENT_SRC_KHR).is_fatal());
        assert!(GpuError::MultiMipCopy(4).is_fatal());
        assert!(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(!GpuError::Vulkan(vk::Result::TIMEOUT).is_fatal());
        assert!(!GpuError::NotHostVisible("texture".into()).is_fatal());
        assert!(!GpuError::Asset("missing.png".into()).is_fatal());
    }
}
