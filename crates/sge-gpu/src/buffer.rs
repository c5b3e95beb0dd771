//! GPU buffers.

use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::BufferDesc;
use crate::command::QueueKind;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::Allocation;

/// A buffer and its memory.
///
/// Host-visible buffers stay mapped for their whole lifetime.
pub struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    mapped: Option<NonNull<u8>>,
    name: String,
}

// The mapped pointer is only dereferenced through `&self`/`&mut self` and
// points into memory owned by this buffer's allocation.
unsafe impl Send for GpuBuffer {}
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    /// Allocate a buffer of `size` bytes.
    pub fn new(
        ctx: &GpuContext,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let mut allocator = ctx.allocator().lock();
        let (buffer, allocation) =
            allocator.alloc_buffer(&BufferDesc { name, size, usage }, location)?;
        let mapped = if allocation.is_host_visible() {
            match allocator.map(&allocation) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    allocator.free_buffer(buffer, allocation)?;
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            location,
            mapped,
            name: name.to_string(),
        })
    }

    /// Create a device-local buffer filled with `data`.
    ///
    /// `TRANSFER_DST` is added to `usage`. Blocks until the upload has
    /// executed.
    pub fn with_data(
        ctx: &GpuContext,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let mut buffer = Self::new(
            ctx,
            data.len() as u64,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )?;
        if let Err(err) = buffer.upload(ctx, 0, data) {
            buffer.destroy(ctx)?;
            return Err(err);
        }
        Ok(buffer)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size => usize::try_from(offset)
                .map_err(|_| GpuError::InvalidDescription("buffer offset overflow".to_string())),
            _ => Err(GpuError::InvalidDescription(format!(
                "range {offset}+{len} is outside buffer '{}' of {} bytes",
                self.name, self.size
            ))),
        }
    }

    fn mapped(&self) -> Result<NonNull<u8>> {
        self.mapped
            .ok_or_else(|| GpuError::NotHostVisible(self.name.clone()))
    }

    /// Write bytes at `offset`. The buffer must be host-visible.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.mapped()?;
        let start = self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(start), data.len());
        }
        Ok(())
    }

    /// Write plain-old-data values at `offset`.
    pub fn write<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read bytes starting at `offset`. The buffer must be host-visible.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self.mapped()?;
        let start = self.check_range(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(start), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Fill a range of the buffer from host memory.
    ///
    /// Host-visible buffers are written directly. Device-local ones go
    /// through a staging buffer and a blocking transfer submission.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn upload(&mut self, ctx: &GpuContext, offset: u64, data: &[u8]) -> Result<()> {
        if self.mapped.is_some() {
            return self.write_bytes(offset, data);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(offset, data.len())?;

        let mut staging = GpuBuffer::new(
            ctx,
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "buffer upload staging",
        )?;
        let result = staging.write_bytes(0, data).and_then(|()| {
            let mut list = ctx.get(QueueKind::Transfer)?;
            list.copy_buffer(
                staging.handle(),
                self.buffer,
                vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size: data.len() as u64,
                },
            );
            ctx.submit(list, true).map(|_| ())
        });
        staging.destroy(ctx)?;
        result
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Returns true if the host can read and write the buffer directly.
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the buffer. Calling this twice is a no-op.
    pub fn destroy(&mut self, ctx: &GpuContext) -> Result<()> {
        let Some(allocation) = self.allocation.take() else {
            return Ok(());
        };
        let mut allocator = ctx.allocator().lock();
        if self.mapped.take().is_some() {
            allocator.unmap(&allocation);
        }
        allocator.free_buffer(self.buffer, allocation)?;
        self.buffer = vk::Buffer::null();
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            tracing::warn!("Buffer '{}' dropped without destroy; its memory leaks", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::context::GpuContextBuilder;

    fn context() -> GpuContext {
        GpuContextBuilder::new()
            .headless(true)
            .build_with(Arc::new(SoftInstance::single()))
            .unwrap()
    }

    #[test]
    fn host_visible_round_trip() {
        let mut ctx = context();
        let mut buffer = GpuBuffer::new(
            &ctx,
            16,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "uniforms",
        )
        .unwrap();
        buffer.write(4, &[1.5f32, -2.0]).unwrap();

        let mut out = [0u8; 8];
        buffer.read_bytes(4, &mut out).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, f32>(&out), &[1.5, -2.0]);
        assert_eq!(ctx.allocator().lock().stats().mapped, 1);

        buffer.destroy(&ctx).unwrap();
        buffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let mut ctx = context();
        let mut buffer = GpuBuffer::new(
            &ctx,
            8,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "small",
        )
        .unwrap();
        assert!(matches!(
            buffer.write_bytes(4, &[0; 8]),
            Err(GpuError::InvalidDescription(_))
        ));
        buffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn device_local_upload_goes_through_staging() {
        let mut ctx = context();
        let data: Vec<u8> = (0..32).collect();
        let mut buffer = GpuBuffer::with_data(&ctx, &data, vk::BufferUsageFlags::VERTEX_BUFFER, "vertices")
            .unwrap();
        assert!(!buffer.is_mapped());
        assert!(matches!(
            buffer.read_bytes(0, &mut [0; 4]),
            Err(GpuError::NotHostVisible(name)) if name == "vertices"
        ));
        // Staging memory is released once the upload completes.
        assert_eq!(ctx.allocator().lock().live_count(), 1);

        buffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn leaked_buffer_fails_shutdown() {
        let mut ctx = context();
        let buffer = GpuBuffer::new(
            &ctx,
            8,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
            "forgotten",
        )
        .unwrap();
        std::mem::forget(buffer);
        assert!(matches!(
            ctx.shutdown(),
            Err(GpuError::AllocationLeak { count: 1, .. })
        ));
    }
}
