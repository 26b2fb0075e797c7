//! Device memory regions, views, and host mirrors.
//!
//! A [`MemoryRegion`] owns one `vkAllocateMemory` block. Views created with
//! [`MemoryRegion::shifted_view`] share the block and differ only in their
//! window offset, so several resources can be packed into one allocation.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Find a memory type index matching a type filter and property flags.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    for i in 0..memory_properties.memory_type_count {
        let type_matches = type_bits & (1 << i) != 0;
        let properties_match = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(required);
        if type_matches && properties_match {
            return Ok(i);
        }
    }
    Err(GpuError::AllocationFailed(format!(
        "no memory type supports {required:?}"
    )))
}

/// Shared state behind every view of one allocation.
#[derive(Debug)]
struct RegionBlock {
    memory: vk::DeviceMemory,
    size: u64,
    /// Persistent mapping, present for host-visible memory.
    mapped: Option<*mut u8>,
    /// Host mirror covering the whole allocation. The lock also serializes
    /// writes through `mapped`.
    host: Mutex<Option<Vec<u8>>>,
    freed: AtomicBool,
    /// Mirror holds writes not yet pushed to the device.
    dirty: AtomicBool,
}

// The mapped pointer is only dereferenced while `host` is locked.
unsafe impl Send for RegionBlock {}
unsafe impl Sync for RegionBlock {}

impl Drop for RegionBlock {
    fn drop(&mut self) {
        if self.memory != vk::DeviceMemory::null() && !self.freed.load(Ordering::Acquire) {
            tracing::warn!(
                size = self.size,
                "GPU memory region dropped without being freed"
            );
        }
    }
}

/// A window into one device memory allocation.
///
/// `size()` always reports the total allocation size; `offset()` reports
/// where this view's window starts. Copies and binds are placed at the
/// window offset and silently clamped to the end of the allocation.
#[derive(Debug)]
pub struct MemoryRegion {
    block: Arc<RegionBlock>,
    offset: u64,
    owner: bool,
}

impl MemoryRegion {
    /// Allocate a region of `size` bytes from memory with the given
    /// properties. Host-visible regions are persistently mapped. When
    /// `with_mirror` is set, a host copy of the allocation is kept for
    /// [`copy_to_host`](Self::copy_to_host) and the sync operations.
    ///
    /// # Safety
    /// The context must outlive the region, and the region must be freed
    /// before the device is destroyed.
    pub unsafe fn new(
        ctx: &GpuContext,
        size: u64,
        properties: vk::MemoryPropertyFlags,
        with_mirror: bool,
    ) -> Result<Self> {
        Self::allocate(ctx, size, u32::MAX, properties, with_mirror)
    }

    /// Allocate a region sized and typed for specific memory requirements.
    ///
    /// # Safety
    /// Same contract as [`new`](Self::new).
    pub(crate) unsafe fn for_requirements(
        ctx: &GpuContext,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        with_mirror: bool,
    ) -> Result<Self> {
        Self::allocate(
            ctx,
            requirements.size,
            requirements.memory_type_bits,
            properties,
            with_mirror,
        )
    }

    unsafe fn allocate(
        ctx: &GpuContext,
        size: u64,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
        with_mirror: bool,
    ) -> Result<Self> {
        let type_index = find_memory_type(ctx.memory_properties(), type_bits, properties)?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        let memory = ctx.device().allocate_memory(&allocate_info, None)?;

        let host_visible = properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mapped = if host_visible {
            match ctx
                .device()
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            {
                Ok(ptr) => Some(ptr.cast::<u8>()),
                Err(e) => {
                    ctx.device().free_memory(memory, None);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        tracing::debug!(size, type_index, host_visible, "allocated memory region");

        Ok(Self {
            block: Arc::new(RegionBlock {
                memory,
                size,
                mapped,
                host: Mutex::new(with_mirror.then(|| vec![0u8; size as usize])),
                freed: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
            }),
            offset: 0,
            owner: true,
        })
    }

    /// A view of the same allocation with its window moved forward by
    /// `delta` bytes. The offset is clamped to the allocation size, so a
    /// view past the end is empty rather than out of bounds.
    #[must_use]
    pub fn shifted_view(&self, delta: u64) -> Self {
        Self {
            block: self.block.clone(),
            offset: (self.offset.saturating_add(delta)).min(self.block.size),
            owner: false,
        }
    }

    /// Total size of the underlying allocation in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.block.size
    }

    /// Byte offset of this view's window into the allocation.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes between the window offset and the end of the allocation.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.block.size - self.offset
    }

    /// Whether the allocation is mapped for direct host access.
    #[must_use]
    pub fn is_host_visible(&self) -> bool {
        self.block.mapped.is_some()
    }

    /// Whether a host mirror was created for this allocation.
    #[must_use]
    pub fn has_mirror(&self) -> bool {
        self.block.host.lock().is_some()
    }

    /// Whether the mirror holds writes not yet pushed to the device.
    #[must_use]
    pub fn host_dirty(&self) -> bool {
        self.block.dirty.load(Ordering::Acquire)
    }

    /// Whether the underlying allocation has been freed.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.block.freed.load(Ordering::Acquire)
    }

    pub(crate) fn memory(&self) -> vk::DeviceMemory {
        self.block.memory
    }

    /// Fail with [`GpuError::RegionExhausted`] when `needed` bytes do not
    /// fit between the window offset and the end of the allocation.
    fn ensure_capacity(&self, needed: u64) -> Result<()> {
        let available = self.remaining();
        if needed > available {
            return Err(GpuError::RegionExhausted { needed, available });
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_freed() {
            return Err(GpuError::InvalidState(
                "memory region has been freed".to_string(),
            ));
        }
        Ok(())
    }

    /// Bind a buffer at this view's window offset.
    ///
    /// The fit check runs before any native call; on failure the buffer is
    /// left unbound. No alignment rounding is applied to the offset.
    ///
    /// # Safety
    /// The device must own both the buffer and this region's memory.
    pub(crate) unsafe fn bind_buffer(
        &self,
        device: &ash::Device,
        buffer: vk::Buffer,
    ) -> Result<()> {
        self.ensure_live()?;
        let requirements = device.get_buffer_memory_requirements(buffer);
        self.ensure_capacity(requirements.size)?;
        device.bind_buffer_memory(buffer, self.block.memory, self.offset)?;
        Ok(())
    }

    /// Bind an image at this view's window offset. Same contract as
    /// [`bind_buffer`](Self::bind_buffer).
    ///
    /// # Safety
    /// The device must own both the image and this region's memory.
    pub(crate) unsafe fn bind_image(&self, device: &ash::Device, image: vk::Image) -> Result<()> {
        self.ensure_live()?;
        let requirements = device.get_image_memory_requirements(image);
        self.ensure_capacity(requirements.size)?;
        device.bind_image_memory(image, self.block.memory, self.offset)?;
        Ok(())
    }

    /// Write `data` to device memory at `offset` bytes past the window
    /// start. The byte count is clamped to the end of the allocation.
    /// Returns the number of bytes written; the mirror, when present, is
    /// updated to match.
    ///
    /// Requires a host-visible region. Device-local regions are written
    /// through a command chain instead.
    pub fn copy_to_device<T: Pod>(&self, data: &[T], offset: u64) -> Result<u64> {
        self.ensure_live()?;
        let Some(ptr) = self.block.mapped else {
            return Err(GpuError::InvalidState(
                "memory region is not host-visible".to_string(),
            ));
        };

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let (start, count) = self.clamp(offset, bytes.len() as u64);

        let mut host = self.block.host.lock();
        if count > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    ptr.add(start as usize),
                    count as usize,
                );
            }
            if let Some(mirror) = host.as_mut() {
                mirror[start as usize..(start + count) as usize]
                    .copy_from_slice(&bytes[..count as usize]);
            }
        }
        Ok(count)
    }

    /// Write `data` to the host mirror at `offset` bytes past the window
    /// start, clamped like [`copy_to_device`](Self::copy_to_device). The
    /// device copy is not touched until [`sync_to_device`](Self::sync_to_device).
    pub fn copy_to_host<T: Pod>(&self, data: &[T], offset: u64) -> Result<u64> {
        self.ensure_live()?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let (start, count) = self.clamp(offset, bytes.len() as u64);

        let mut host = self.block.host.lock();
        let mirror = host.as_mut().ok_or(GpuError::NoHostMirror)?;
        if count > 0 {
            mirror[start as usize..(start + count) as usize]
                .copy_from_slice(&bytes[..count as usize]);
            self.block.dirty.store(true, Ordering::Release);
        }
        Ok(count)
    }

    /// Read from the host mirror at `offset` bytes past the window start
    /// into `out`, clamped to the end of the allocation. Returns the
    /// number of bytes read.
    pub fn read_host<T: Pod>(&self, out: &mut [T], offset: u64) -> Result<u64> {
        self.ensure_live()?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        let (start, count) = self.clamp(offset, bytes.len() as u64);

        let host = self.block.host.lock();
        let mirror = host.as_ref().ok_or(GpuError::NoHostMirror)?;
        if count > 0 {
            bytes[..count as usize]
                .copy_from_slice(&mirror[start as usize..(start + count) as usize]);
        }
        Ok(count)
    }

    /// Borrow the mirror bytes of this view's window.
    pub fn host_bytes(&self) -> Result<MappedMutexGuard<'_, [u8]>> {
        self.ensure_live()?;
        let offset = self.offset as usize;
        MutexGuard::try_map(self.block.host.lock(), |host| {
            host.as_mut().map(|mirror| &mut mirror[offset..])
        })
        .map_err(|_| GpuError::NoHostMirror)
    }

    /// Push the mirror's window contents to device memory and clear the
    /// dirty flag. Requires a host-visible region with a mirror.
    pub fn sync_to_device(&self) -> Result<()> {
        self.ensure_live()?;
        let Some(ptr) = self.block.mapped else {
            return Err(GpuError::InvalidState(
                "memory region is not host-visible".to_string(),
            ));
        };

        let host = self.block.host.lock();
        let mirror = host.as_ref().ok_or(GpuError::NoHostMirror)?;
        let start = self.offset as usize;
        let len = (self.block.size - self.offset) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(mirror.as_ptr().add(start), ptr.add(start), len);
        }
        self.block.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Pull device memory into the mirror's window and clear the dirty
    /// flag. Requires a host-visible region with a mirror.
    pub fn sync_to_host(&self) -> Result<()> {
        self.ensure_live()?;
        let Some(ptr) = self.block.mapped else {
            return Err(GpuError::InvalidState(
                "memory region is not host-visible".to_string(),
            ));
        };

        let mut host = self.block.host.lock();
        let mirror = host.as_mut().ok_or(GpuError::NoHostMirror)?;
        let start = self.offset as usize;
        let len = (self.block.size - self.offset) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(start), mirror.as_mut_ptr().add(start), len);
        }
        self.block.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Free the underlying allocation. Views never free; calling this on a
    /// view is a logged no-op. Freeing twice is also a no-op.
    ///
    /// # Safety
    /// No GPU work may still reference the allocation, and no resource
    /// bound to it may be used afterwards.
    pub unsafe fn free(&self, device: &ash::Device) -> Result<()> {
        if !self.owner {
            tracing::debug!("free ignored on region view");
            return Ok(());
        }

        let mut host = self.block.host.lock();
        if self.block.freed.swap(true, Ordering::AcqRel) {
            tracing::debug!("region already freed");
            return Ok(());
        }
        if self.block.mapped.is_some() {
            device.unmap_memory(self.block.memory);
        }
        device.free_memory(self.block.memory, None);
        *host = None;
        Ok(())
    }

    /// Clamp a window-relative write of `requested` bytes to the end of
    /// the allocation. Returns the absolute start and the clamped count.
    fn clamp(&self, offset: u64, requested: u64) -> (u64, u64) {
        let start = (self.offset.saturating_add(offset)).min(self.block.size);
        let count = requested.min(self.block.size - start);
        if count < requested {
            tracing::debug!(requested, clamped = count, "copy clamped to region end");
        }
        (start, count)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Build a region over fake "device memory" backed by a caller-owned
    /// byte buffer, so copy and sync paths run without a GPU.
    pub(crate) fn host_backed_region(backing: &mut [u8], with_mirror: bool) -> MemoryRegion {
        MemoryRegion {
            block: Arc::new(RegionBlock {
                memory: vk::DeviceMemory::null(),
                size: backing.len() as u64,
                mapped: Some(backing.as_mut_ptr()),
                host: Mutex::new(with_mirror.then(|| vec![0u8; backing.len()])),
                freed: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
            }),
            offset: 0,
            owner: true,
        }
    }

    /// Build an unmapped region with no backing device memory.
    pub(crate) fn unmapped_region(size: u64, with_mirror: bool) -> MemoryRegion {
        MemoryRegion {
            block: Arc::new(RegionBlock {
                memory: vk::DeviceMemory::null(),
                size,
                mapped: None,
                host: Mutex::new(with_mirror.then(|| vec![0u8; size as usize])),
                freed: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
            }),
            offset: 0,
            owner: true,
        }
    }

    pub(crate) fn mark_freed(region: &MemoryRegion) {
        region.block.freed.store(true, Ordering::Release);
    }

    /// Read one byte of the fake device memory directly.
    pub(crate) fn device_byte(region: &MemoryRegion, index: usize) -> u8 {
        let ptr = region.block.mapped.expect("region has no backing");
        unsafe { *ptr.add(index) }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{device_byte, host_backed_region, mark_freed, unmapped_region};
    use super::*;

    #[test]
    fn find_memory_type_honors_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;

        let host = find_memory_type(
            &props,
            u32::MAX,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(host, 1);

        // Type 1 excluded by the filter, type 2 still qualifies
        let masked =
            find_memory_type(&props, 0b101, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(masked, 2);

        assert!(find_memory_type(
            &props,
            0b001,
            vk::MemoryPropertyFlags::HOST_VISIBLE
        )
        .is_err());
    }

    #[test]
    fn views_report_total_size_and_window_offset() {
        let region = unmapped_region(800, false);
        assert_eq!(region.size(), 800);
        assert_eq!(region.offset(), 0);
        assert_eq!(region.remaining(), 800);

        let view = region.shifted_view(200);
        assert_eq!(view.size(), 800);
        assert_eq!(view.offset(), 200);
        assert_eq!(view.remaining(), 600);

        let tail = view.shifted_view(600);
        assert_eq!(tail.offset(), 800);
        assert_eq!(tail.remaining(), 0);
    }

    #[test]
    fn view_offset_never_exceeds_allocation_size() {
        let region = unmapped_region(777, false);
        for base in [0u64, 1, 400, 776, 777] {
            let view = region.shifted_view(base);
            for delta in [0u64, 1, 500, 777, u64::MAX] {
                let shifted = view.shifted_view(delta);
                assert!(shifted.offset() <= shifted.size());
            }
        }
    }

    #[test]
    fn copy_to_device_writes_backing_and_mirror() {
        let mut backing = vec![0u8; 64];
        {
            let region = host_backed_region(&mut backing, true);
            let data = [0xAB_u8; 16];
            let written = region.copy_to_device(&data[..], 8).unwrap();
            assert_eq!(written, 16);

            let host = region.host_bytes().unwrap();
            assert_eq!(&host[8..24], &[0xAB; 16]);
            assert!(!region.host_dirty());
        }
        assert_eq!(&backing[8..24], &[0xAB; 16]);
        assert_eq!(backing[24], 0);
    }

    #[test]
    fn copy_past_end_is_clamped() {
        let mut backing = vec![0u8; 100];
        let region = host_backed_region(&mut backing, false);
        let view = region.shifted_view(50);

        let data = [1u8; 80];
        let written = view.copy_to_device(&data[..], 0).unwrap();
        assert_eq!(written, 50);

        // A copy aimed entirely past the end writes nothing
        let written = view.copy_to_device(&data[..8], 60).unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn host_copy_requires_mirror() {
        let region = unmapped_region(32, false);
        let data = [0u8; 4];
        assert!(matches!(
            region.copy_to_host(&data[..], 0),
            Err(GpuError::NoHostMirror)
        ));
        assert!(region.host_bytes().is_err());
    }

    #[test]
    fn host_copy_marks_dirty_until_synced() {
        let mut backing = vec![0u8; 32];
        let region = host_backed_region(&mut backing, true);

        let data = [7u8; 32];
        region.copy_to_host(&data[..], 0).unwrap();
        assert!(region.host_dirty());
        // Device bytes untouched until the sync
        assert_eq!(device_byte(&region, 0), 0);

        region.sync_to_device().unwrap();
        assert!(!region.host_dirty());
        drop(region);
        assert_eq!(backing[0], 7);
        assert_eq!(backing[31], 7);
    }

    #[test]
    fn sync_to_host_pulls_device_bytes() {
        let mut backing = vec![0u8; 16];
        backing[4] = 99;
        let region = host_backed_region(&mut backing, true);

        region.sync_to_host().unwrap();
        let mut out = [0u8; 16];
        region.read_host(&mut out[..], 0).unwrap();
        assert_eq!(out[4], 99);
    }

    #[test]
    fn round_trip_preserves_typed_data() {
        let mut backing = vec![0u8; 800];
        let region = host_backed_region(&mut backing, true);

        let data = [2503_u32; 200];
        let written = region.copy_to_device(&data[..], 0).unwrap();
        assert_eq!(written, 800);

        region.sync_to_host().unwrap();
        let mut out = [0_u32; 200];
        region.read_host(&mut out[..], 0).unwrap();
        assert!(out.iter().all(|&v| v == 2503));
    }

    #[test]
    fn shared_mirror_is_visible_through_views() {
        let mut backing = vec![0u8; 64];
        let region = host_backed_region(&mut backing, true);
        let view = region.shifted_view(32);

        let data = [5u8; 64];
        region.copy_to_host(&data[..], 0).unwrap();
        let tail = view.host_bytes().unwrap();
        assert_eq!(tail.len(), 32);
        assert!(tail.iter().all(|&b| b == 5));
    }

    #[test]
    fn capacity_check_reports_needed_and_available() {
        let region = unmapped_region(800, false);
        let view = region.shifted_view(200);

        assert!(view.ensure_capacity(600).is_ok());
        match view.ensure_capacity(700) {
            Err(GpuError::RegionExhausted { needed, available }) => {
                assert_eq!(needed, 700);
                assert_eq!(available, 600);
            }
            other => panic!("expected RegionExhausted, got {other:?}"),
        }
    }

    #[test]
    fn freed_region_rejects_access() {
        let region = unmapped_region(16, true);
        mark_freed(&region);
        assert!(region.is_freed());

        let data = [0u8; 4];
        let mut out = [0u8; 4];
        assert!(region.copy_to_host(&data[..], 0).is_err());
        assert!(region.read_host(&mut out[..], 0).is_err());
        assert!(region.host_bytes().is_err());
    }
}
