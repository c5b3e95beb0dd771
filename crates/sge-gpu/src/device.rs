//! Logical device creation.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::backend::{DeviceBackend, InstanceBackend};
use crate::error::{GpuError, Result};
use crate::physical_device::{PhysicalDevice, QueueFamilyIndices};

/// Extension that must be enabled whenever a device exposes it.
pub const PORTABILITY_SUBSET: &str = "VK_KHR_portability_subset";

/// Swapchain device extension.
pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";

/// Device functions that must resolve once an extension is enabled.
fn extension_functions(extension: &str) -> &'static [&'static str] {
    match extension {
        SWAPCHAIN_EXTENSION => &[
            "vkCreateSwapchainKHR",
            "vkDestroySwapchainKHR",
            "vkGetSwapchainImagesKHR",
            "vkAcquireNextImageKHR",
            "vkQueuePresentKHR",
        ],
        _ => &[],
    }
}

/// What the caller wants from the logical device.
#[derive(Clone, Debug, Default)]
pub struct DeviceRequest {
    /// Capabilities the device must have a queue family for.
    pub queue_flags: vk::QueueFlags,
    /// Extensions without which construction fails.
    pub required_extensions: Vec<String>,
    /// Extensions enabled when available and skipped with a warning otherwise.
    pub optional_extensions: Vec<String>,
    /// Device layers, enabled when available.
    pub layers: Vec<String>,
}

/// Base features the renderer turns on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub geometry_shader: bool,
    pub sampler_anisotropy: bool,
}

/// Fully verified device creation parameters handed to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCreateDesc {
    /// One queue is created for each of these families.
    pub queue_families: Vec<u32>,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
    pub features: DeviceFeatures,
}

impl DeviceCreateDesc {
    /// Check `request` against what `physical` supports.
    ///
    /// Unavailable optional extensions and layers are logged and dropped; an
    /// unavailable required extension fails with
    /// [`GpuError::ExtensionNotSupported`].
    pub fn resolve(physical: &PhysicalDevice, request: &DeviceRequest) -> Result<Self> {
        let families = physical.query_queue_families(request.queue_flags);
        if !families.satisfies(request.queue_flags) {
            return Err(GpuError::DeviceCreation(format!(
                "{} has no queue family for {:?}",
                physical.name(),
                request.queue_flags
            )));
        }
        // One request per family the device exposes, matching the pool layout.
        let family_count = u32::try_from(physical.queue_family_count()).unwrap_or(u32::MAX);
        let queue_families: Vec<u32> = (0..family_count).collect();

        let mut extensions = Vec::new();
        for ext in &request.required_extensions {
            if !physical.is_extension_supported(ext) {
                return Err(GpuError::ExtensionNotSupported(ext.clone()));
            }
            push_unique(&mut extensions, ext);
        }
        for ext in &request.optional_extensions {
            if physical.is_extension_supported(ext) {
                push_unique(&mut extensions, ext);
            } else {
                tracing::warn!("device extension {} is not present", ext);
            }
        }
        if physical.is_extension_supported(PORTABILITY_SUBSET) {
            push_unique(&mut extensions, PORTABILITY_SUBSET);
        }

        let mut layers = Vec::new();
        for layer in &request.layers {
            if physical.is_layer_supported(layer) {
                push_unique(&mut layers, layer);
            } else {
                tracing::warn!("device layer {} is not present", layer);
            }
        }

        let supported = physical.features();
        let features = DeviceFeatures {
            geometry_shader: supported.geometry_shader == vk::TRUE,
            sampler_anisotropy: supported.sampler_anisotropy == vk::TRUE,
        };

        Ok(Self {
            queue_families,
            extensions,
            layers,
            features,
        })
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

/// The logical device plus the verified configuration it was built with.
pub struct LogicalDevice {
    backend: Arc<dyn DeviceBackend>,
    physical: PhysicalDevice,
    families: QueueFamilyIndices,
    desc: DeviceCreateDesc,
}

impl LogicalDevice {
    /// Create the logical device and resolve the functions of every enabled
    /// extension.
    ///
    /// A function that cannot be resolved is fatal
    /// ([`GpuError::MissingFunction`]).
    pub fn create(
        instance: &dyn InstanceBackend,
        physical: PhysicalDevice,
        request: &DeviceRequest,
    ) -> Result<Self> {
        let desc = DeviceCreateDesc::resolve(&physical, request)?;
        let backend = instance.create_device(&physical, &desc)?;

        for ext in &desc.extensions {
            for function in extension_functions(ext) {
                let name = CString::new(*function)
                    .map_err(|e| GpuError::Other(e.to_string()))?;
                if !backend.has_function(&name) {
                    tracing::error!("{} enabled but {} did not resolve", ext, function);
                    return Err(GpuError::MissingFunction((*function).to_string()));
                }
            }
        }

        let families = physical.query_queue_families(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        );
        tracing::info!(
            "Created logical device on {} with {} queue famil{}, extensions [{}]",
            physical.name(),
            desc.queue_families.len(),
            if desc.queue_families.len() == 1 { "y" } else { "ies" },
            desc.extensions.join(", ")
        );

        Ok(Self {
            backend,
            physical,
            families,
            desc,
        })
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn physical(&self) -> &PhysicalDevice {
        &self.physical
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.families
    }

    /// Returns true if the extension was enabled at creation.
    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.desc.extensions.iter().any(|ext| ext == name)
    }

    pub fn features(&self) -> DeviceFeatures {
        self.desc.features
    }

    /// Queue handle for every created family.
    pub fn queues(&self) -> HashMap<u32, vk::Queue> {
        self.desc
            .queue_families
            .iter()
            .map(|&family| (family, self.backend.get_queue(family)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftAdapter, SoftInstance};

    fn request() -> DeviceRequest {
        DeviceRequest {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            required_extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            optional_extensions: vec!["VK_EXT_memory_budget".to_string()],
            layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
        }
    }

    fn first(instance: &SoftInstance) -> PhysicalDevice {
        PhysicalDevice::enumerate(instance).unwrap().remove(0)
    }

    #[test]
    fn missing_optional_extension_is_skipped() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("gpu")]);
        let device = LogicalDevice::create(&instance, first(&instance), &request()).unwrap();
        assert!(device.is_extension_enabled(SWAPCHAIN_EXTENSION));
        assert!(!device.is_extension_enabled("VK_EXT_memory_budget"));
    }

    #[test]
    fn missing_required_extension_fails() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("gpu").with_extensions(&[])]);
        let result = LogicalDevice::create(&instance, first(&instance), &request());
        assert!(matches!(result, Err(GpuError::ExtensionNotSupported(ext)) if ext == SWAPCHAIN_EXTENSION));
    }

    #[test]
    fn portability_subset_is_enabled_when_present() {
        let instance = SoftInstance::new(vec![
            SoftAdapter::new("gpu").with_extensions(&[SWAPCHAIN_EXTENSION, PORTABILITY_SUBSET])
        ]);
        let desc = DeviceCreateDesc::resolve(&first(&instance), &request()).unwrap();
        assert_eq!(desc.extensions, vec![SWAPCHAIN_EXTENSION, PORTABILITY_SUBSET]);
    }

    #[test]
    fn one_queue_request_per_family() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("gpu").with_queue_families(vec![
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ])]);
        let desc = DeviceCreateDesc::resolve(&first(&instance), &request()).unwrap();
        assert_eq!(desc.queue_families, vec![0, 1, 2]);
    }

    #[test]
    fn features_follow_support() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("gpu").without_features()]);
        let desc = DeviceCreateDesc::resolve(&first(&instance), &request()).unwrap();
        assert_eq!(desc.features, DeviceFeatures::default());

        let instance = SoftInstance::new(vec![SoftAdapter::new("gpu")]);
        let desc = DeviceCreateDesc::resolve(&first(&instance), &request()).unwrap();
        assert!(desc.features.geometry_shader && desc.features.sampler_anisotropy);
    }

    #[test]
    fn unavailable_layer_is_skipped() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("gpu")]);
        let desc = DeviceCreateDesc::resolve(&first(&instance), &request()).unwrap();
        assert!(desc.layers.is_empty());

        let instance = SoftInstance::new(vec![
            SoftAdapter::new("gpu").with_layers(&["VK_LAYER_KHRONOS_validation"])
        ]);
        let desc = DeviceCreateDesc::resolve(&first(&instance), &request()).unwrap();
        assert_eq!(desc.layers, vec!["VK_LAYER_KHRONOS_validation"]);
    }

    #[test]
    fn unresolved_function_is_fatal() {
        let instance = SoftInstance::new(vec![
            SoftAdapter::new("gpu").with_missing_function("vkQueuePresentKHR")
        ]);
        let result = LogicalDevice::create(&instance, first(&instance), &request());
        match result {
            Err(err @ GpuError::MissingFunction(_)) => {
                assert!(err.is_fatal());
                assert_eq!(err.to_string(), "Device function could not be resolved: vkQueuePresentKHR");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("device creation should fail"),
        }
    }
}
