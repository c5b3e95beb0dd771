//! GPU memory management.
//!
//! [`GpuAllocator`] is the single place buffers and images get their backing
//! memory. The device backend owns the actual sub-allocator (`gpu-allocator`
//! for Vulkan); this layer keeps the bookkeeping needed for leak detection,
//! host mapping rules and statistics.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::{AllocationId, BufferDesc, DeviceBackend, ImageDesc};
use crate::error::{GpuError, Result};

/// Ownership token of one live allocation.
///
/// Deliberately not `Clone`: handing the token back to [`GpuAllocator`] is
/// the only way to release the memory.
#[derive(Debug)]
pub struct Allocation {
    id: AllocationId,
    location: MemoryLocation,
    size: u64,
}

impl Allocation {
    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Bytes reserved on the device.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true if the host can map this allocation.
    pub fn is_host_visible(&self) -> bool {
        is_host_visible(self.location)
    }
}

fn is_host_visible(location: MemoryLocation) -> bool {
    matches!(location, MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu)
}

/// Resource type an allocation backs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Image,
}

#[derive(Debug)]
struct Record {
    name: String,
    kind: ResourceKind,
    location: MemoryLocation,
    size: u64,
    mapped: bool,
}

/// Live allocation totals for one memory location.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocationStats {
    pub count: usize,
    pub bytes: u64,
}

/// Live allocation totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub gpu_only: LocationStats,
    pub cpu_to_gpu: LocationStats,
    pub gpu_to_cpu: LocationStats,
    pub mapped: usize,
}

impl AllocatorStats {
    /// Number of live allocations across all locations.
    pub fn total_count(&self) -> usize {
        self.gpu_only.count + self.cpu_to_gpu.count + self.gpu_to_cpu.count
    }

    /// Bytes held across all locations.
    pub fn total_bytes(&self) -> u64 {
        self.gpu_only.bytes + self.cpu_to_gpu.bytes + self.gpu_to_cpu.bytes
    }
}

/// Central allocator for buffer and image memory.
pub struct GpuAllocator {
    device: Arc<dyn DeviceBackend>,
    live: HashMap<AllocationId, Record>,
    shut_down: bool,
}

impl GpuAllocator {
    /// Create a new allocator.
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        Self {
            device,
            live: HashMap::new(),
            shut_down: false,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(GpuError::InvalidState("Allocator already shut down".to_string()));
        }
        Ok(())
    }

    fn track(
        &mut self,
        id: AllocationId,
        name: &str,
        kind: ResourceKind,
        location: MemoryLocation,
        size: u64,
    ) -> Allocation {
        self.live.insert(
            id,
            Record {
                name: name.to_string(),
                kind,
                location,
                size,
                mapped: false,
            },
        );
        Allocation { id, location, size }
    }

    /// Create a buffer backed by memory from `location`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn alloc_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
        location: MemoryLocation,
    ) -> Result<(vk::Buffer, Allocation)> {
        self.ensure_running()?;
        if desc.size == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        let (buffer, block) = self.device.create_buffer(desc, location)?;
        let allocation = self.track(block.id, desc.name, ResourceKind::Buffer, location, block.size);
        Ok((buffer, allocation))
    }

    /// Create an image backed by memory from `location`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn alloc_image(
        &mut self,
        desc: &ImageDesc<'_>,
        location: MemoryLocation,
    ) -> Result<(vk::Image, Allocation)> {
        self.ensure_running()?;
        let (image, block) = self.device.create_image(desc, location)?;
        let allocation = self.track(block.id, desc.name, ResourceKind::Image, location, block.size);
        Ok((image, allocation))
    }

    fn untrack(&mut self, allocation: &Allocation, kind: ResourceKind) -> Result<Record> {
        let record = self.live.remove(&allocation.id).ok_or_else(|| {
            GpuError::InvalidState(format!("unknown allocation {:?}", allocation.id))
        })?;
        debug_assert_eq!(record.kind, kind, "allocation freed as the wrong resource kind");
        Ok(record)
    }

    /// Destroy a buffer and release its memory.
    pub fn free_buffer(&mut self, buffer: vk::Buffer, allocation: Allocation) -> Result<()> {
        self.untrack(&allocation, ResourceKind::Buffer)?;
        self.device.destroy_buffer(buffer, allocation.id)
    }

    /// Destroy an image and release its memory.
    pub fn free_image(&mut self, image: vk::Image, allocation: Allocation) -> Result<()> {
        self.untrack(&allocation, ResourceKind::Image)?;
        self.device.destroy_image(image, allocation.id)
    }

    /// Host pointer to the start of a host-visible allocation.
    ///
    /// Device-local memory fails with [`GpuError::NotHostVisible`].
    pub fn map(&mut self, allocation: &Allocation) -> Result<NonNull<u8>> {
        let record = self.live.get_mut(&allocation.id).ok_or_else(|| {
            GpuError::InvalidState(format!("unknown allocation {:?}", allocation.id))
        })?;
        if !is_host_visible(record.location) {
            return Err(GpuError::NotHostVisible(record.name.clone()));
        }
        let ptr = self
            .device
            .mapped_ptr(allocation.id)
            .ok_or_else(|| GpuError::NotHostVisible(record.name.clone()))?;
        record.mapped = true;
        Ok(ptr)
    }

    /// Release a host mapping.
    ///
    /// Host-visible memory stays persistently mapped by the backend, so this
    /// only ends the caller's right to use the pointer.
    pub fn unmap(&mut self, allocation: &Allocation) {
        if let Some(record) = self.live.get_mut(&allocation.id) {
            record.mapped = false;
        }
    }

    /// Live allocation totals.
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats::default();
        for record in self.live.values() {
            let slot = match record.location {
                MemoryLocation::CpuToGpu => &mut stats.cpu_to_gpu,
                MemoryLocation::GpuToCpu => &mut stats.gpu_to_cpu,
                _ => &mut stats.gpu_only,
            };
            slot.count += 1;
            slot.bytes += record.size;
            if record.mapped {
                stats.mapped += 1;
            }
        }
        stats
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Shut the allocator down.
    ///
    /// Every allocation must have been freed; any survivor is logged and
    /// reported as [`GpuError::AllocationLeak`].
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if self.live.is_empty() {
            tracing::debug!("Allocator shut down cleanly");
            return Ok(());
        }

        let mut names: Vec<String> = self
            .live
            .values()
            .map(|record| format!("{} ({:?}, {} bytes)", record.name, record.kind, record.size))
            .collect();
        names.sort();
        let names = names.join(", ");
        tracing::error!("{} allocation(s) leaked at shutdown: {}", self.live.len(), names);
        Err(GpuError::AllocationLeak {
            count: self.live.len(),
            names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftInstance;

    fn buffer_desc(name: &str, size: u64) -> BufferDesc<'_> {
        BufferDesc {
            name,
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    #[test]
    fn map_device_local_fails() {
        let device = SoftInstance::single().create_default_device();
        let mut allocator = GpuAllocator::new(device);
        let (buffer, allocation) = allocator
            .alloc_buffer(&buffer_desc("vertices", 64), MemoryLocation::GpuOnly)
            .unwrap();

        assert!(matches!(allocator.map(&allocation), Err(GpuError::NotHostVisible(name)) if name == "vertices"));

        allocator.free_buffer(buffer, allocation).unwrap();
        allocator.shutdown().unwrap();
    }

    #[test]
    fn map_host_visible_succeeds() {
        let device = SoftInstance::single().create_default_device();
        let mut allocator = GpuAllocator::new(device);
        let (buffer, allocation) = allocator
            .alloc_buffer(&buffer_desc("staging", 16), MemoryLocation::CpuToGpu)
            .unwrap();

        let ptr = allocator.map(&allocation).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xAB, 16) };
        assert_eq!(allocator.stats().mapped, 1);
        allocator.unmap(&allocation);
        assert_eq!(allocator.stats().mapped, 0);

        allocator.free_buffer(buffer, allocation).unwrap();
        allocator.shutdown().unwrap();
    }

    #[test]
    fn leak_is_reported_at_shutdown() {
        let device = SoftInstance::single().create_default_device();
        let mut allocator = GpuAllocator::new(device);
        let (_buffer, _allocation) = allocator
            .alloc_buffer(&buffer_desc("forgotten", 32), MemoryLocation::GpuOnly)
            .unwrap();

        let err = allocator.shutdown().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, GpuError::AllocationLeak { count: 1, ref names } if names.starts_with("forgotten")));
    }

    #[test]
    fn stats_track_locations() {
        let device = SoftInstance::single().create_default_device();
        let mut allocator = GpuAllocator::new(device);
        let (a, alloc_a) = allocator
            .alloc_buffer(&buffer_desc("a", 100), MemoryLocation::GpuOnly)
            .unwrap();
        let (b, alloc_b) = allocator
            .alloc_buffer(&buffer_desc("b", 50), MemoryLocation::GpuToCpu)
            .unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.gpu_only, LocationStats { count: 1, bytes: 100 });
        assert_eq!(stats.gpu_to_cpu, LocationStats { count: 1, bytes: 50 });
        assert_eq!(stats.total_count(), 2);
        assert_eq!(stats.total_bytes(), 150);

        allocator.free_buffer(a, alloc_a).unwrap();
        allocator.free_buffer(b, alloc_b).unwrap();
        assert_eq!(allocator.stats(), AllocatorStats::default());
        allocator.shutdown().unwrap();
    }

    #[test]
    fn zero_sized_buffer_is_rejected() {
        let device = SoftInstance::single().create_default_device();
        let mut allocator = GpuAllocator::new(device);
        let result = allocator.alloc_buffer(&buffer_desc("empty", 0), MemoryLocation::CpuToGpu);
        assert!(matches!(result, Err(GpuError::InvalidDescription(_))));
    }

    #[test]
    fn allocation_after_shutdown_fails() {
        let device = SoftInstance::single().create_default_device();
        let mut allocator = GpuAllocator::new(device);
        allocator.shutdown().unwrap();
        let result = allocator.alloc_buffer(&buffer_desc("late", 4), MemoryLocation::CpuToGpu);
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }
}
