//! Vulkan backend over `ash`.

mod device;

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;

pub use self::device::VulkanDevice;
use super::{DeviceBackend, InstanceBackend, WindowHandles};
use crate::device::DeviceCreateDesc;
use crate::error::{GpuError, Result};
use crate::physical_device::{GpuVendor, PhysicalDevice};

/// Instance extensions for presentation on the current platform.
///
/// Extensions the loader does not offer are skipped, which leaves a
/// headless-capable instance.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xcb_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name).map_err(|e| GpuError::Other(e.to_string()))?;
    let engine_name = c"SGE";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    // SAFETY: entry is valid per the caller
    let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };
    let available_extensions: HashSet<&CStr> = available_extensions
        .iter()
        .filter_map(|props| props.extension_name_as_c_str().ok())
        .collect();
    let extensions: Vec<&CStr> = surface_instance_extensions()
        .into_iter()
        .filter(|ext| {
            let found = available_extensions.contains(ext);
            if !found {
                tracing::debug!("Instance extension {:?} not available", ext);
            }
            found
        })
        .collect();
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Check that requested layers are available
    // SAFETY: entry is valid per the caller
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str().ok() == Some(*layer));
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    // SAFETY: create_info only references locals that outlive the call
    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok(instance)
}

/// The Vulkan instance backend.
///
/// Devices created from it must be dropped before it.
pub struct VulkanInstance {
    surface_loader: ash::khr::surface::Instance,
    instance: ash::Instance,
    entry: ash::Entry,
}

impl VulkanInstance {
    /// Load Vulkan and create an instance.
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;
        // SAFETY: entry was just loaded
        let instance = unsafe { create_instance(&entry, app_name, enable_validation)? };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        tracing::info!("Vulkan instance created (validation: {})", enable_validation);
        Ok(Self {
            surface_loader,
            instance,
            entry,
        })
    }

    /// Raw `ash` instance.
    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    fn describe(&self, handle: vk::PhysicalDevice) -> Result<PhysicalDevice> {
        // SAFETY: handle was enumerated from this instance
        unsafe {
            let properties = self.instance.get_physical_device_properties(handle);
            let features = self.instance.get_physical_device_features(handle);
            let queue_families = self
                .instance
                .get_physical_device_queue_family_properties(handle);
            let extensions = self
                .instance
                .enumerate_device_extension_properties(handle)?
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok())
                .map(|name| name.to_string_lossy().into_owned())
                .collect();
            let layers = self
                .instance
                .enumerate_device_layer_properties(handle)?
                .iter()
                .filter_map(|layer| layer.layer_name_as_c_str().ok())
                .map(|name| name.to_string_lossy().into_owned())
                .collect();

            let memory = self.instance.get_physical_device_memory_properties(handle);
            let device_local_mb = memory
                .memory_heaps
                .iter()
                .take(memory.memory_heap_count as usize)
                .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|h| h.size / (1024 * 1024))
                .sum();

            let name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "Unknown".to_string());

            Ok(PhysicalDevice {
                handle,
                name,
                vendor: GpuVendor::from_vendor_id(properties.vendor_id),
                device_type: properties.device_type,
                api_version: properties.api_version,
                queue_families,
                extensions,
                layers,
                features,
                device_local_mb,
            })
        }
    }
}

impl InstanceBackend for VulkanInstance {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        // SAFETY: instance is valid for the lifetime of self
        let handles = unsafe { self.instance.enumerate_physical_devices()? };
        handles
            .into_iter()
            .map(|handle| self.describe(handle))
            .collect()
    }

    fn create_device(
        &self,
        physical: &PhysicalDevice,
        desc: &DeviceCreateDesc,
    ) -> Result<Arc<dyn DeviceBackend>> {
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = desc
            .queue_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let to_cstrings = |names: &[String]| -> Result<Vec<CString>> {
            names
                .iter()
                .map(|name| CString::new(name.as_str()).map_err(|e| GpuError::Other(e.to_string())))
                .collect()
        };
        let extensions = to_cstrings(&desc.extensions)?;
        let layers = to_cstrings(&desc.layers)?;
        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();
        let layer_names: Vec<*const std::ffi::c_char> =
            layers.iter().map(|layer| layer.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::default()
            .geometry_shader(desc.features.geometry_shader)
            .sampler_anisotropy(desc.features.sampler_anisotropy);

        #[allow(deprecated)]
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .enabled_features(&features);

        // SAFETY: physical device belongs to this instance, create_info references locals
        let device = unsafe {
            self.instance
                .create_device(physical.handle(), &create_info, None)
                .map_err(|e| GpuError::DeviceCreation(e.to_string()))?
        };

        let swapchain_enabled = desc
            .extensions
            .iter()
            .any(|ext| ext == crate::device::SWAPCHAIN_EXTENSION);
        let backend = VulkanDevice::new(
            &self.entry,
            &self.instance,
            physical.handle(),
            device,
            desc.queue_families.clone(),
            swapchain_enabled,
        )?;
        Ok(Arc::new(backend))
    }

    fn create_surface(&self, window: &dyn WindowHandles) -> Result<vk::SurfaceKHR> {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: the handles come from a live window, which the caller keeps
        // alive until the surface is destroyed
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        // SAFETY: the swapchain using the surface has been destroyed by the caller
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // SAFETY: every device created from this instance is gone
        unsafe { self.instance.destroy_instance(None) };
    }
}
