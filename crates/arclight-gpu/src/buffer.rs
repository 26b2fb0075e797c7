//! GPU buffers bound to memory regions.

use crate::context::GpuContext;
use crate::error::Result;
use crate::memory::MemoryRegion;
use ash::vk;
use bytemuck::Pod;

/// A Vulkan buffer plus the region view it is bound to.
///
/// Buffers either own a fresh allocation sized to their requirements, or
/// bind into a caller-provided region at that region's current window
/// offset. Destroying the buffer frees the allocation only in the first
/// case; bound regions stay alive for their other users.
#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    region: MemoryRegion,
    size: u64,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Create a buffer backed by its own memory allocation.
    ///
    /// # Safety
    /// The context must outlive the buffer, and the buffer must be
    /// destroyed before the device.
    pub unsafe fn new(
        ctx: &GpuContext,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        with_mirror: bool,
    ) -> Result<Self> {
        let handle = create_raw_buffer(ctx.device(), size, usage)?;
        let requirements = ctx.device().get_buffer_memory_requirements(handle);

        let region =
            match MemoryRegion::for_requirements(ctx, requirements, properties, with_mirror) {
                Ok(region) => region,
                Err(e) => {
                    ctx.device().destroy_buffer(handle, None);
                    return Err(e);
                }
            };
        if let Err(e) = region.bind_buffer(ctx.device(), handle) {
            let _ = region.free(ctx.device());
            ctx.device().destroy_buffer(handle, None);
            return Err(e);
        }

        Ok(Self {
            handle,
            region,
            size,
            usage,
        })
    }

    /// Create a buffer inside an existing region, bound at the region's
    /// current window offset.
    ///
    /// Fails with [`GpuError::RegionExhausted`](crate::GpuError::RegionExhausted)
    /// before any bind call when the buffer's memory requirements exceed
    /// the window; the region is untouched in that case.
    ///
    /// # Safety
    /// The region's allocation must outlive the buffer.
    pub unsafe fn bind_to_region(
        ctx: &GpuContext,
        region: &MemoryRegion,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let handle = create_raw_buffer(ctx.device(), size, usage)?;
        if let Err(e) = region.bind_buffer(ctx.device(), handle) {
            ctx.device().destroy_buffer(handle, None);
            return Err(e);
        }

        Ok(Self {
            handle,
            region: region.shifted_view(0),
            size,
            usage,
        })
    }

    /// Raw buffer handle.
    #[must_use]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested buffer size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags the buffer was created with.
    #[must_use]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// The region view this buffer is bound into.
    #[must_use]
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// Write host data through the region at `offset` bytes past the
    /// buffer's window. See [`MemoryRegion::copy_to_device`].
    pub fn write<T: Pod>(&self, data: &[T], offset: u64) -> Result<u64> {
        self.region.copy_to_device(data, offset)
    }

    /// Destroy the buffer and free its allocation when it owns one.
    ///
    /// # Safety
    /// No GPU work may still reference the buffer.
    pub unsafe fn destroy(&mut self, device: &ash::Device) -> Result<()> {
        if self.handle != vk::Buffer::null() {
            device.destroy_buffer(self.handle, None);
            self.handle = vk::Buffer::null();
        }
        self.region.free(device)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(size: u64, region: MemoryRegion) -> Self {
        Self {
            handle: vk::Buffer::null(),
            region,
            size,
            usage: vk::BufferUsageFlags::empty(),
        }
    }
}

unsafe fn create_raw_buffer(
    device: &ash::Device,
    size: u64,
    usage: vk::BufferUsageFlags,
) -> Result<vk::Buffer> {
    let create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let handle = device.create_buffer(&create_info, None)?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::{host_backed_region, unmapped_region};

    #[test]
    fn write_goes_through_the_bound_region() {
        let mut backing = vec![0u8; 128];
        let buffer = Buffer::for_tests(128, host_backed_region(&mut backing, true));

        let data = [3u8; 16];
        assert_eq!(buffer.write(&data[..], 0).unwrap(), 16);
        let host = buffer.region().host_bytes().unwrap();
        assert_eq!(&host[..16], &[3u8; 16]);
    }

    #[test]
    fn buffer_keeps_its_region_window() {
        let region = unmapped_region(800, false);
        let view = region.shifted_view(200);
        let buffer = Buffer::for_tests(200, view);

        assert_eq!(buffer.region().offset(), 200);
        assert_eq!(buffer.region().size(), 800);
        assert_eq!(buffer.size(), 200);
    }
}
