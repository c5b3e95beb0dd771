//! Physical device enumeration, capability queries and selection.

use std::collections::HashSet;

use ash::vk;

use crate::backend::InstanceBackend;
use crate::error::{GpuError, Result};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Queue family index per capability, as found by
/// [`PhysicalDevice::query_queue_families`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Returns true if every capability in `requested` has a family.
    pub fn satisfies(&self, requested: vk::QueueFlags) -> bool {
        (!requested.contains(vk::QueueFlags::GRAPHICS) || self.graphics.is_some())
            && (!requested.contains(vk::QueueFlags::COMPUTE) || self.compute.is_some())
            && (!requested.contains(vk::QueueFlags::TRANSFER) || self.transfer.is_some())
    }

    /// Distinct family indices, in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = [self.graphics, self.compute, self.transfer]
            .into_iter()
            .flatten()
            .collect();
        families.sort_unstable();
        families.dedup();
        families
    }

    fn slot_mut(&mut self, capability: vk::QueueFlags) -> &mut Option<u32> {
        if capability == vk::QueueFlags::GRAPHICS {
            &mut self.graphics
        } else if capability == vk::QueueFlags::COMPUTE {
            &mut self.compute
        } else {
            &mut self.transfer
        }
    }
}

const CAPABILITIES: [vk::QueueFlags; 3] = [
    vk::QueueFlags::GRAPHICS,
    vk::QueueFlags::COMPUTE,
    vk::QueueFlags::TRANSFER,
];

/// A hardware device together with the capability data cached at
/// enumeration time.
#[derive(Clone, Debug)]
pub struct PhysicalDevice {
    pub(crate) handle: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) vendor: GpuVendor,
    pub(crate) device_type: vk::PhysicalDeviceType,
    pub(crate) api_version: u32,
    pub(crate) queue_families: Vec<vk::QueueFamilyProperties>,
    pub(crate) extensions: HashSet<String>,
    pub(crate) layers: HashSet<String>,
    pub(crate) features: vk::PhysicalDeviceFeatures,
    pub(crate) device_local_mb: u64,
}

impl PhysicalDevice {
    /// Enumerate every physical device visible to `instance`.
    ///
    /// A system without devices yields an empty list.
    pub fn enumerate(instance: &dyn InstanceBackend) -> Result<Vec<Self>> {
        let devices = instance.enumerate_physical_devices()?;
        tracing::debug!(
            "{} backend reports {} physical device(s)",
            instance.name(),
            devices.len()
        );
        Ok(devices)
    }

    /// Find a queue family for each capability in `requested`.
    ///
    /// Each capability takes the first family exposing it. The scan stops at
    /// the first family after which every requested capability has an index.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn query_queue_families(&self, requested: vk::QueueFlags) -> QueueFamilyIndices {
        let mut indices = QueueFamilyIndices::default();

        for (index, family) in (0u32..).zip(&self.queue_families) {
            if family.queue_count == 0 {
                continue;
            }

            for capability in CAPABILITIES {
                if requested.contains(capability) && family.queue_flags.contains(capability) {
                    indices.slot_mut(capability).get_or_insert(index);
                }
            }

            if indices.satisfies(requested) {
                break;
            }
        }

        indices
    }

    /// Capability flags of a queue family, empty for unknown indices.
    pub fn family_flags(&self, family: u32) -> vk::QueueFlags {
        self.queue_families
            .get(family as usize)
            .map_or(vk::QueueFlags::empty(), |props| props.queue_flags)
    }

    /// Returns true if the device exposes the named device extension.
    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    /// Returns true if the device exposes the named device layer.
    pub fn is_layer_supported(&self, name: &str) -> bool {
        self.layers.contains(name)
    }

    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.device_type
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn queue_family_count(&self) -> usize {
        self.queue_families.len()
    }

    /// Base features the device supports.
    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    /// Device-local memory in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.device_local_mb
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}, Vulkan {}.{}, {} MB VRAM)",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            self.device_local_mb
        )
    }

    /// Selection score, or `None` if the device cannot run the renderer.
    pub fn score(&self, required_extensions: &[String]) -> Option<u64> {
        if self
            .query_queue_families(vk::QueueFlags::GRAPHICS)
            .graphics
            .is_none()
        {
            return None;
        }
        if let Some(missing) = required_extensions
            .iter()
            .find(|ext| !self.is_extension_supported(ext))
        {
            tracing::debug!("{} lacks required extension {}", self.name, missing);
            return None;
        }

        let mut score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        score += self.device_local_mb / 1024;
        if self.features.geometry_shader == vk::TRUE {
            score += 10;
        }
        Some(score)
    }
}

/// Pick the device to run on.
///
/// A suitable device whose name contains `preferred` (case-insensitive) wins
/// outright; otherwise the highest-scoring suitable device is chosen.
pub fn select_physical_device(
    devices: &[PhysicalDevice],
    required_extensions: &[String],
    preferred: Option<&str>,
) -> Result<PhysicalDevice> {
    let suitable: Vec<(&PhysicalDevice, u64)> = devices
        .iter()
        .filter_map(|device| device.score(required_extensions).map(|score| (device, score)))
        .collect();

    if let Some(preferred) = preferred {
        let wanted = preferred.to_lowercase();
        if let Some((device, _)) = suitable
            .iter()
            .find(|(device, _)| device.name.to_lowercase().contains(&wanted))
        {
            return Ok((*device).clone());
        }
        tracing::warn!("Preferred GPU '{}' not found, falling back to scoring", preferred);
    }

    suitable
        .into_iter()
        .max_by_key(|(_, score)| *score)
        .map(|(device, _)| device.clone())
        .ok_or(GpuError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftAdapter, SoftInstance};

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;
    const ALL: vk::QueueFlags = vk::QueueFlags::from_raw(0b111);

    fn device_with(families: Vec<vk::QueueFlags>) -> PhysicalDevice {
        let instance = SoftInstance::new(vec![SoftAdapter::new("test").with_queue_families(families)]);
        PhysicalDevice::enumerate(&instance).unwrap().remove(0)
    }

    #[test]
    fn zero_devices_is_empty() {
        let instance = SoftInstance::new(Vec::new());
        assert!(PhysicalDevice::enumerate(&instance).unwrap().is_empty());
    }

    #[test]
    fn single_combined_family() {
        let device = device_with(vec![G | C | T]);
        let indices = device.query_queue_families(ALL);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.compute, Some(0));
        assert_eq!(indices.transfer, Some(0));
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn search_stops_at_first_satisfying_family() {
        let device = device_with(vec![G | C | T, C | T, T]);
        let indices = device.query_queue_families(ALL);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.compute, Some(0));
        assert_eq!(indices.transfer, Some(0));
    }

    #[test]
    fn missing_capabilities_come_from_later_families() {
        let device = device_with(vec![G, C | T, T]);
        let indices = device.query_queue_families(ALL);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.compute, Some(1));
        assert_eq!(indices.transfer, Some(1));
    }

    #[test]
    fn returned_families_carry_requested_bits() {
        let device = device_with(vec![T, C | T, G | C | T, G]);
        let indices = device.query_queue_families(ALL);
        for (capability, family) in [
            (G, indices.graphics),
            (C, indices.compute),
            (T, indices.transfer),
        ] {
            let family = family.unwrap();
            assert!(device.family_flags(family).contains(capability));
        }
    }

    #[test]
    fn first_family_with_a_capability_wins() {
        let device = device_with(vec![G, T, T]);
        let indices = device.query_queue_families(G | T);
        assert_eq!(indices.transfer, Some(1));
        assert_eq!(indices.compute, None);
    }

    #[test]
    fn only_requested_capabilities_are_filled() {
        let device = device_with(vec![G | C | T]);
        let indices = device.query_queue_families(G);
        assert_eq!(indices.graphics, Some(0));
        assert!(indices.compute.is_none() && indices.transfer.is_none());
        assert!(indices.satisfies(G));
        assert!(!indices.satisfies(G | T));
    }

    #[test]
    fn extension_and_layer_queries() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("test")
            .with_extensions(&["VK_KHR_swapchain"])
            .with_layers(&["VK_LAYER_KHRONOS_validation"])]);
        let device = PhysicalDevice::enumerate(&instance).unwrap().remove(0);
        assert!(device.is_extension_supported("VK_KHR_swapchain"));
        assert!(!device.is_extension_supported("VK_KHR_portability_subset"));
        assert!(device.is_layer_supported("VK_LAYER_KHRONOS_validation"));
        assert!(!device.is_layer_supported("VK_LAYER_LUNARG_api_dump"));
    }

    #[test]
    fn selection_prefers_discrete_then_name() {
        let instance = SoftInstance::new(vec![
            SoftAdapter::new("Integrated Thing").with_device_type(vk::PhysicalDeviceType::INTEGRATED_GPU),
            SoftAdapter::new("Discrete Thing"),
            SoftAdapter::new("Compute Only").with_queue_families(vec![C | T]),
        ]);
        let devices = PhysicalDevice::enumerate(&instance).unwrap();

        let picked = select_physical_device(&devices, &[], None).unwrap();
        assert_eq!(picked.name(), "Discrete Thing");

        let picked = select_physical_device(&devices, &[], Some("integrated")).unwrap();
        assert_eq!(picked.name(), "Integrated Thing");

        // A device without graphics is never picked, even by name.
        let picked = select_physical_device(&devices, &[], Some("compute only")).unwrap();
        assert_eq!(picked.name(), "Discrete Thing");
    }

    #[test]
    fn required_extension_filters_devices() {
        let instance = SoftInstance::new(vec![SoftAdapter::new("bare").with_extensions(&[])]);
        let devices = PhysicalDevice::enumerate(&instance).unwrap();
        let result = select_physical_device(&devices, &["VK_KHR_swapchain".to_string()], None);
        assert!(matches!(result, Err(GpuError::NoSuitableDevice)));
    }

    #[test]
    fn vendor_from_id() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
