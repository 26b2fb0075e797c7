//! Headless harness wiring a context, staging pool, and transfer chain.

use std::sync::Arc;

use arclight_gpu::{
    Buffer, CommandChain, GpuContext, GpuContextBuilder, Image, ImageConfig, QueueRole,
    StagingPool,
};
use ash::vk;

use crate::{Result, TestError};

/// A context, staging pool, and transfer chain for device-backed tests.
///
/// Dropping the harness waits for the device and tears everything down,
/// so tests can bail out with `?` without leaking Vulkan objects.
pub struct TransferHarness {
    ctx: GpuContext,
    staging: Arc<StagingPool>,
    chain: CommandChain,
}

impl TransferHarness {
    const STAGING_BUFFERS: usize = 4;
    const STAGING_BUFFER_SIZE: u64 = 1024 * 1024;

    /// Bring up a headless context with validation and a transfer chain
    /// backed by a small staging pool.
    pub fn new() -> Result<Self> {
        let ctx = GpuContextBuilder::new()
            .app_name("arclight-test")
            .validation(true)
            .build()?;
        let staging = unsafe {
            Arc::new(StagingPool::with_limits(
                &ctx,
                Self::STAGING_BUFFERS,
                Self::STAGING_BUFFER_SIZE,
            )?)
        };
        let chain = unsafe { CommandChain::new(&ctx, QueueRole::Transfer, Arc::clone(&staging))? };
        Ok(Self {
            ctx,
            staging,
            chain,
        })
    }

    #[must_use]
    pub fn ctx(&self) -> &GpuContext {
        &self.ctx
    }

    #[must_use]
    pub fn staging(&self) -> &Arc<StagingPool> {
        &self.staging
    }

    pub fn chain_mut(&mut self) -> &mut CommandChain {
        &mut self.chain
    }

    /// Device-local buffer usable as both transfer source and target.
    pub fn device_buffer(&self, size: u64) -> Result<Buffer> {
        let buffer = unsafe {
            Buffer::new(
                &self.ctx,
                size,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            )?
        };
        Ok(buffer)
    }

    /// Small transferable color image.
    pub fn color_image(&self, width: u32, height: u32) -> Result<Image> {
        let image = unsafe { Image::new(&self.ctx, &ImageConfig::color(width, height))? };
        Ok(image)
    }

    /// Upload `data` into a fresh device-local buffer and read it back
    /// through the staging pool. `data` must fit one staging buffer, as
    /// the readback uses a single lease.
    pub fn roundtrip(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = self.device_buffer(data.len() as u64)?;
        let readback = unsafe {
            self.chain.copy_to_buffer(&self.ctx, data, &buffer)?;
            let readback = self.chain.read_buffer(&self.ctx, &buffer, None, 0)?;
            self.chain.submit(&self.ctx)?;
            self.chain.synchronize(&self.ctx)?;
            readback
        };

        let mut out = vec![0u8; data.len()];
        let copied = readback.resolve(&mut out[..])?;
        unsafe { buffer.destroy(self.ctx.device())? };

        if copied != data.len() as u64 {
            return Err(TestError::Mismatch(format!(
                "readback returned {copied} of {} bytes",
                data.len()
            )));
        }
        Ok(out)
    }

    /// Round-trip `data` and fail with the first diverging byte offset.
    pub fn verify_roundtrip(&mut self, data: &[u8]) -> Result<()> {
        let echoed = self.roundtrip(data)?;
        if echoed != data {
            let diverged = echoed.iter().zip(data).take_while(|(a, b)| a == b).count();
            return Err(TestError::Mismatch(format!(
                "readback diverges from upload at byte {diverged}"
            )));
        }
        tracing::debug!(bytes = data.len(), "staged round trip verified");
        Ok(())
    }
}

impl Drop for TransferHarness {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.wait_idle();
            self.chain.destroy(&self.ctx);
            let _ = self.staging.destroy(self.ctx.device());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arclight_gpu::{
        write_storage_buffer, write_uniform_buffer, ComputePipeline, DescriptorPool,
        DescriptorSetLayoutBuilder, GpuError, MemoryRegion, Synchronization,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // SPIR-V for an empty `main` compute kernel, local size 1x1x1.
    const EMPTY_KERNEL_SPV: [u32; 35] = [
        0x0723_0203, 0x0001_0000, 0, 6, 0, // header, bound 6
        0x0002_0011, 1, // OpCapability Shader
        0x0003_000E, 0, 1, // OpMemoryModel Logical GLSL450
        0x0005_000F, 5, 4, 0x6E69_616D, 0, // OpEntryPoint GLCompute %4 "main"
        0x0006_0010, 4, 17, 1, 1, 1, // OpExecutionMode %4 LocalSize 1 1 1
        0x0002_0013, 2, // %2 = OpTypeVoid
        0x0003_0021, 3, 2, // %3 = OpTypeFunction %2
        0x0005_0036, 2, 4, 0, 3, // %4 = OpFunction %2 None %3
        0x0002_00F8, 5, // %5 = OpLabel
        0x0001_00FD, // OpReturn
        0x0001_0038, // OpFunctionEnd
    ];

    fn byte_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn context_and_chain_come_up() {
        let harness = TransferHarness::new().unwrap();
        assert_eq!(harness.chain.slot_count(), 4);
        assert_eq!(harness.staging.max_buffers(), 4);
        assert_eq!(harness.staging.buffer_size(), 1024 * 1024);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffers_partition_a_shared_region() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;
        let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

        unsafe {
            let region = MemoryRegion::new(
                ctx,
                1024,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                true,
            )
            .unwrap();

            let mut first = Buffer::bind_to_region(ctx, &region, 256, usage).unwrap();
            let mut second =
                Buffer::bind_to_region(ctx, &region.shifted_view(256), 256, usage).unwrap();
            assert_eq!(first.region().offset(), 0);
            assert_eq!(second.region().offset(), 256);

            first.destroy(ctx.device()).unwrap();
            second.destroy(ctx.device()).unwrap();
            region.free(ctx.device()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn oversized_binds_leave_the_region_untouched() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;
        let usage = vk::BufferUsageFlags::TRANSFER_SRC;

        unsafe {
            let region = MemoryRegion::new(
                ctx,
                4096,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                false,
            )
            .unwrap();

            let tail = region.shifted_view(4032);
            let err = Buffer::bind_to_region(ctx, &tail, 4096, usage).unwrap_err();
            assert!(matches!(err, GpuError::RegionExhausted { .. }));

            let mut fits = Buffer::bind_to_region(ctx, &region, 256, usage).unwrap();
            assert_eq!(fits.region().offset(), 0);

            fits.destroy(ctx.device()).unwrap();
            region.free(ctx.device()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn typed_words_round_trip_through_the_mirror() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;

        unsafe {
            let region = MemoryRegion::new(
                ctx,
                800,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                true,
            )
            .unwrap();

            let data = [2503u32; 200];
            region.copy_to_device(&data, 0).unwrap();
            region.sync_to_host().unwrap();

            let mut out = [0u32; 200];
            region.read_host(&mut out, 0).unwrap();
            assert_eq!(out, data);

            region.free(ctx.device()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn staged_uploads_read_back_identical() {
        let mut harness = TransferHarness::new().unwrap();
        harness.verify_roundtrip(&byte_pattern(64 * 1024)).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn large_uploads_span_multiple_leases() {
        let mut harness = TransferHarness::new().unwrap();
        let data = byte_pattern(5 * 512 * 1024);
        let mut buffer = harness.device_buffer(data.len() as u64).unwrap();

        unsafe {
            harness
                .chain
                .copy_to_buffer(&harness.ctx, &data, &buffer)
                .unwrap();
            harness.chain.submit(&harness.ctx).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();
        }

        let window = TransferHarness::STAGING_BUFFER_SIZE;
        let mut offset = 0u64;
        while offset < data.len() as u64 {
            let len = window.min(data.len() as u64 - offset);
            let readback = unsafe {
                let readback = harness
                    .chain
                    .read_buffer(&harness.ctx, &buffer, Some(len), offset)
                    .unwrap();
                harness.chain.submit(&harness.ctx).unwrap();
                harness.chain.synchronize(&harness.ctx).unwrap();
                readback
            };

            let mut out = vec![0u8; len as usize];
            assert_eq!(readback.resolve(&mut out[..]).unwrap(), len);
            assert_eq!(&out[..], &data[offset as usize..(offset + len) as usize]);
            offset += len;
        }

        unsafe { buffer.destroy(harness.ctx.device()).unwrap() };
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn image_uploads_read_back_identical() {
        let mut harness = TransferHarness::new().unwrap();
        let mut image = harness.color_image(16, 16).unwrap();
        let data: Vec<u8> = (0..16u32 * 16 * 4).map(|i| (i * 7 % 256) as u8).collect();

        let readback = unsafe {
            harness
                .chain
                .copy_to_image(&harness.ctx, &data, &mut image)
                .unwrap();
            let readback = harness.chain.read_image(&harness.ctx, &mut image).unwrap();
            harness.chain.submit(&harness.ctx).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();
            readback
        };
        assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let mut out = vec![0u8; data.len()];
        assert_eq!(readback.resolve(&mut out[..]).unwrap(), data.len() as u64);
        assert_eq!(out, data);

        unsafe { image.destroy(harness.ctx.device()).unwrap() };
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn layered_image_uploads_cover_every_layer() {
        let mut harness = TransferHarness::new().unwrap();
        let config = ImageConfig::color(8, 8).layers(3);
        let mut image = unsafe { Image::new(&harness.ctx, &config).unwrap() };
        assert_eq!(image.layers(), 3);

        let data = byte_pattern(8 * 8 * 4 * 3);
        let readback = unsafe {
            harness
                .chain
                .copy_to_image(&harness.ctx, &data, &mut image)
                .unwrap();
            let readback = harness.chain.read_image(&harness.ctx, &mut image).unwrap();
            harness.chain.submit(&harness.ctx).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();
            readback
        };

        let mut out = vec![0u8; data.len()];
        assert_eq!(readback.resolve(&mut out[..]).unwrap(), data.len() as u64);
        assert_eq!(out, data);

        unsafe { image.destroy(harness.ctx.device()).unwrap() };
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn short_image_uploads_are_rejected() {
        let mut harness = TransferHarness::new().unwrap();
        let mut image = harness.color_image(16, 16).unwrap();
        let short = byte_pattern(16 * 16 * 2);

        unsafe {
            let err = harness
                .chain
                .copy_to_image(&harness.ctx, &short, &mut image)
                .unwrap_err();
            assert!(matches!(err, GpuError::InvalidState(_)));
            // Nothing was recorded against the image
            assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

            harness.chain.submit(&harness.ctx).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();
            image.destroy(harness.ctx.device()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn layout_reverts_restore_the_previous_layout() {
        let mut harness = TransferHarness::new().unwrap();
        let mut image = harness.color_image(8, 8).unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

        unsafe {
            harness
                .chain
                .transition(&harness.ctx, &mut image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .unwrap();
            harness
                .chain
                .transition(&harness.ctx, &mut image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .unwrap();
            harness
                .chain
                .revert_layout(&harness.ctx, &mut image)
                .unwrap();
            assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(image.old_layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

            harness.chain.submit(&harness.ctx).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();
            image.destroy(harness.ctx.device()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn image_uploads_revert_a_known_layout() {
        let mut harness = TransferHarness::new().unwrap();
        let mut image = harness.color_image(8, 8).unwrap();
        let data = byte_pattern(8 * 8 * 4);

        unsafe {
            harness
                .chain
                .transition(&harness.ctx, &mut image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .unwrap();
            harness
                .chain
                .copy_to_image(&harness.ctx, &data, &mut image)
                .unwrap();
            assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            assert_eq!(image.old_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);

            harness.chain.submit(&harness.ctx).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();
            image.destroy(harness.ctx.device()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn submissions_resume_after_a_reset() {
        let mut harness = TransferHarness::new().unwrap();
        harness.verify_roundtrip(&byte_pattern(4096)).unwrap();

        unsafe { harness.chain.reset(&harness.ctx).unwrap() };

        // The ordering semaphore parked before the reset is still
        // signaled; the next submission consumes it rather than
        // signaling it twice.
        harness.verify_roundtrip(&byte_pattern(4096)).unwrap();
        harness.verify_roundtrip(&byte_pattern(4096)).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn leases_respect_the_pool_cap() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;
        let pool = &harness.staging;

        let live = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..5 {
                scope.spawn(|| {
                    let lease = unsafe { pool.acquire(ctx) }.unwrap();
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(25));
                    live.fetch_sub(1, Ordering::SeqCst);
                    drop(lease);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= pool.max_buffers());
        assert!(pool.len() <= pool.max_buffers());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn exhausted_pools_stall_until_a_lease_returns() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;
        let pool = &harness.staging;

        let mut held = Vec::new();
        for _ in 0..pool.max_buffers() {
            held.push(unsafe { pool.acquire(ctx) }.unwrap());
        }
        assert!(pool.try_acquire().is_none());

        let released = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                // Blocks in the at-cap spin until the main thread gives
                // a lease back.
                let lease = unsafe { pool.acquire(ctx) }.unwrap();
                assert!(released.load(Ordering::SeqCst));
                drop(lease);
            });
            std::thread::sleep(std::time::Duration::from_millis(25));
            released.store(true, Ordering::SeqCst);
            held.pop();
        });

        assert_eq!(pool.len(), pool.max_buffers());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn an_empty_kernel_dispatches() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;

        unsafe {
            let mut chain =
                CommandChain::new(ctx, QueueRole::Compute, Arc::clone(&harness.staging)).unwrap();
            let pipeline = ComputePipeline::new(ctx.device(), &EMPTY_KERNEL_SPV, &[], 0).unwrap();

            chain.bind_pipeline(ctx, &pipeline.handle()).unwrap();
            chain.dispatch(ctx, 1, 1, 1).unwrap();
            chain.submit(ctx).unwrap();
            chain.synchronize(ctx).unwrap();

            pipeline.destroy(ctx.device());
            chain.destroy(ctx);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn descriptor_sets_allocate_and_write() {
        let harness = TransferHarness::new().unwrap();
        let ctx = &harness.ctx;
        let device = ctx.device();

        unsafe {
            let layout = DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
                .uniform_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .build(device)
                .unwrap();
            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 1,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 1,
                },
            ];
            let pool = DescriptorPool::new(device, 1, &pool_sizes).unwrap();
            let sets = pool.allocate(device, &[layout]).unwrap();

            let mut buffer = Buffer::new(
                ctx,
                256,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            )
            .unwrap();
            write_storage_buffer(device, sets[0], 0, &buffer, 0, None);
            write_uniform_buffer(device, sets[0], 1, &buffer, 0, Some(64));

            pool.reset(device).unwrap();
            pool.destroy(device);
            device.destroy_descriptor_set_layout(layout, None);
            buffer.destroy(device).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn frame_bundles_chain_by_semaphore() {
        let mut harness = TransferHarness::new().unwrap();

        unsafe {
            let mut first = Synchronization::new(harness.ctx.device(), 1, false).unwrap();
            let mut second = Synchronization::new(harness.ctx.device(), 1, false).unwrap();
            second.wait_on(&first);
            assert_eq!(second.wait_semaphores().len(), 1);

            harness.chain.submit_frame(&harness.ctx, &first).unwrap();
            harness.chain.submit_frame(&harness.ctx, &second).unwrap();
            harness.chain.synchronize(&harness.ctx).unwrap();

            first.destroy(harness.ctx.device());
            second.destroy(harness.ctx.device());
        }
    }
}
