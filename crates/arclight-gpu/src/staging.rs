//! Pooled host-visible staging buffers.
//!
//! Transfers between host data and device-local resources go through a
//! pool of persistently mapped staging buffers. A caller leases one
//! buffer at a time; the lease is a lock guard, so releasing it is just
//! dropping it. The pool grows on demand up to a fixed cap and then makes
//! callers wait for a buffer to come back.

use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::error::Result;
use ash::vk;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::sync::Arc;

/// Buffers the pool will grow to before callers start waiting.
pub const DEFAULT_MAX_BUFFERS: usize = 4;

/// Size of each staging buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: u64 = 512 * 1024 * 1024;

/// Exclusive lease on one staging buffer.
///
/// The buffer is host-visible with a mirror, so readback paths can pull
/// device bytes through it. Dropping the lease returns the buffer to the
/// pool; drop only after the GPU work using the buffer has been recorded.
pub type StagingLease = ArcMutexGuard<RawMutex, Buffer>;

/// A bounded pool of staging buffers shared by command chains.
pub struct StagingPool {
    entries: RwLock<Vec<Arc<Mutex<Buffer>>>>,
    max_buffers: usize,
    buffer_size: u64,
}

impl StagingPool {
    /// Create a pool with default limits and one buffer ready.
    ///
    /// # Safety
    /// The context must outlive the pool, and [`destroy`](Self::destroy)
    /// must run before the device goes away.
    pub unsafe fn new(ctx: &GpuContext) -> Result<Self> {
        Self::with_limits(ctx, DEFAULT_MAX_BUFFERS, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool with explicit limits and one buffer ready.
    ///
    /// # Safety
    /// Same contract as [`new`](Self::new).
    pub unsafe fn with_limits(
        ctx: &GpuContext,
        max_buffers: usize,
        buffer_size: u64,
    ) -> Result<Self> {
        let pool = Self {
            entries: RwLock::new(Vec::with_capacity(max_buffers)),
            max_buffers: max_buffers.max(1),
            buffer_size,
        };
        let first = pool.create_buffer(ctx)?;
        pool.entries.write().push(Arc::new(Mutex::new(first)));
        Ok(pool)
    }

    /// Lease a free staging buffer, growing the pool if every buffer is
    /// busy and the cap allows. At the cap this spins over the pool until
    /// a lease comes back; use [`try_acquire`](Self::try_acquire) to back
    /// off instead of waiting.
    ///
    /// # Safety
    /// The context must be the one the pool was created with.
    pub unsafe fn acquire(&self, ctx: &GpuContext) -> Result<StagingLease> {
        let mut stalled = false;
        loop {
            if let Some(lease) = self.try_acquire() {
                return Ok(lease);
            }

            let mut entries = self.entries.write();
            if entries.len() < self.max_buffers {
                let buffer = self.create_buffer(ctx)?;
                let entry = Arc::new(Mutex::new(buffer));
                let lease = entry.try_lock_arc();
                entries.push(entry);
                tracing::debug!(buffers = entries.len(), "staging pool grew");
                if let Some(lease) = lease {
                    return Ok(lease);
                }
            } else {
                drop(entries);
                if !stalled {
                    stalled = true;
                    tracing::warn!(
                        buffers = self.max_buffers,
                        "staging pool exhausted, waiting for a lease"
                    );
                }
                std::thread::yield_now();
            }
        }
    }

    /// Lease a free staging buffer without growing or waiting.
    #[must_use]
    pub fn try_acquire(&self) -> Option<StagingLease> {
        let entries = self.entries.read();
        entries.iter().find_map(|entry| entry.try_lock_arc())
    }

    /// Size of each staging buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Buffers the pool may grow to.
    #[must_use]
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Buffers currently alive in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Destroy every pooled buffer.
    ///
    /// # Safety
    /// All leases must have been released and all GPU work using pool
    /// buffers must have completed; this blocks on each buffer's lock.
    pub unsafe fn destroy(&self, device: &ash::Device) -> Result<()> {
        let mut entries = self.entries.write();
        for entry in entries.drain(..) {
            entry.lock().destroy(device)?;
        }
        Ok(())
    }

    unsafe fn create_buffer(&self, ctx: &GpuContext) -> Result<Buffer> {
        Buffer::new(
            ctx,
            self.buffer_size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )
    }

    #[cfg(test)]
    pub(crate) fn stub_pool(max_buffers: usize, buffers: Vec<Buffer>) -> Self {
        let entries = buffers
            .into_iter()
            .map(|b| Arc::new(Mutex::new(b)))
            .collect();
        Self {
            entries: RwLock::new(entries),
            max_buffers,
            buffer_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::unmapped_region;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stub_buffers(count: usize) -> Vec<Buffer> {
        (0..count)
            .map(|_| Buffer::for_tests(64, unmapped_region(64, true)))
            .collect()
    }

    #[test]
    fn leases_are_exclusive() {
        let pool = StagingPool::stub_pool(1, stub_buffers(1));

        let lease = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        drop(lease);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn pool_hands_out_each_buffer_once() {
        let pool = StagingPool::stub_pool(2, stub_buffers(2));

        let first = pool.try_acquire().unwrap();
        let second = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        drop(first);
        let third = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(second);
        drop(third);
    }

    #[test]
    fn concurrent_callers_never_exceed_the_cap() {
        let pool = StagingPool::stub_pool(4, stub_buffers(4));
        let held = AtomicUsize::new(0);
        let high_water = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..5 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let lease = loop {
                            if let Some(lease) = pool.try_acquire() {
                                break lease;
                            }
                            std::thread::yield_now();
                        };
                        let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                        high_water.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        held.fetch_sub(1, Ordering::SeqCst);
                        drop(lease);
                    }
                });
            }
        });

        assert!(high_water.load(Ordering::SeqCst) <= 4);
        assert!(high_water.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn pool_reports_its_limits() {
        let pool = StagingPool::stub_pool(4, stub_buffers(2));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.max_buffers(), 4);
        assert!(!pool.is_empty());
    }
}
