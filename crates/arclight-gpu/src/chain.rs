//! Command chains: lazy recording, staged transfers, paced submission.
//!
//! A [`CommandChain`] owns a ring of command buffers on one queue. Work
//! is recorded lazily: the first operation after a submit begins the next
//! ring slot, waiting for that slot's previous submission to finish
//! first. Host data moves through leased [`StagingPool`] buffers, and
//! submissions on the same chain are ordered by semaphore without any
//! CPU stall.

use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::pipeline::PipelineHandle;
use crate::queue::{Queue, QueueRole};
use crate::staging::{StagingLease, StagingPool};
use crate::sync::{create_fence, create_semaphore, reset_fence, wait_for_fence, Synchronization};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// Command buffers in a chain's ring.
pub const DEFAULT_SLOT_COUNT: usize = 4;

struct ChainSlot {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    finished: vk::Semaphore,
    /// Set while a submission of this slot may still be executing.
    in_flight: bool,
    /// Staging leases referenced by the slot's last submission. Released
    /// once the slot's fence has been waited.
    leases: Vec<StagingLease>,
}

/// Color target for the draw operations.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Clear color applied on load; `None` keeps the previous contents.
    pub clear: Option<[f32; 4]>,
}

/// An ordered stream of GPU work on one queue.
pub struct CommandChain {
    queue: Queue,
    staging: Arc<StagingPool>,
    pool: vk::CommandPool,
    slots: Vec<ChainSlot>,
    current: usize,
    recording: bool,
    rendering_open: bool,
    render_target: Option<RenderTarget>,
    /// Semaphore signaled by the previous submission, waited by the next.
    pending_wait: Option<vk::Semaphore>,
    /// Staging leases acquired by the recording in progress. They move
    /// into the slot on submit; releasing them earlier would let the pool
    /// hand the same staging buffer out before the copy executes.
    leases: Vec<StagingLease>,
}

impl CommandChain {
    /// Create a chain on the queue serving `role` with the default ring.
    ///
    /// # Safety
    /// The context must outlive the chain, and the chain must be
    /// destroyed before the device.
    pub unsafe fn new(
        ctx: &GpuContext,
        role: QueueRole,
        staging: Arc<StagingPool>,
    ) -> Result<Self> {
        Self::with_slots(ctx, role, staging, DEFAULT_SLOT_COUNT)
    }

    /// Create a chain with an explicit ring size.
    ///
    /// # Safety
    /// Same contract as [`new`](Self::new).
    pub unsafe fn with_slots(
        ctx: &GpuContext,
        role: QueueRole,
        staging: Arc<StagingPool>,
        slot_count: usize,
    ) -> Result<Self> {
        let device = ctx.device();
        let queue = ctx.queue_for(role).clone();

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue.family());
        let pool = device.create_command_pool(&pool_info, None)?;

        let slot_count = slot_count.max(1);
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count as u32);
        let cmds = match device.allocate_command_buffers(&alloc_info) {
            Ok(cmds) => cmds,
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(e.into());
            }
        };

        let mut slots = Vec::with_capacity(slot_count);
        for cmd in cmds {
            let fence = match create_fence(device, false) {
                Ok(fence) => fence,
                Err(e) => {
                    destroy_slots(device, &mut slots, pool);
                    return Err(e);
                }
            };
            let finished = match create_semaphore(device) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_fence(fence, None);
                    destroy_slots(device, &mut slots, pool);
                    return Err(e);
                }
            };
            slots.push(ChainSlot {
                cmd,
                fence,
                finished,
                in_flight: false,
                leases: Vec::new(),
            });
        }

        Ok(Self {
            queue,
            staging,
            pool,
            slots,
            current: 0,
            recording: false,
            rendering_open: false,
            render_target: None,
            pending_wait: None,
            leases: Vec::new(),
        })
    }

    /// Queue this chain submits to.
    #[must_use]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Number of ring slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether operations have been recorded since the last submit.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Begin recording into the current ring slot if not already
    /// recording. Waits for the slot's previous submission to finish, so
    /// at most `slot_count` submissions of one chain are ever in flight.
    ///
    /// # Safety
    /// The context must be the one the chain was created with.
    pub unsafe fn record(&mut self, ctx: &GpuContext) -> Result<()> {
        if self.recording {
            return Ok(());
        }
        let device = ctx.device();
        let slot = &mut self.slots[self.current];
        if slot.in_flight {
            wait_for_fence(device, slot.fence, u64::MAX)?;
            reset_fence(device, slot.fence)?;
            slot.in_flight = false;
        }
        slot.leases.clear();
        device.reset_command_buffer(slot.cmd, vk::CommandBufferResetFlags::empty())?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(slot.cmd, &begin_info)?;
        self.recording = true;
        Ok(())
    }

    /// Upload host data into a buffer through the staging pool.
    ///
    /// Uploads larger than one staging buffer are split across several
    /// leases. The byte count is clamped to the destination size. Every
    /// lease stays held until the slot's submission has completed, so one
    /// recording can stage at most the pool's total capacity.
    ///
    /// # Safety
    /// The buffer must stay alive until the chain's work completes.
    pub unsafe fn copy_to_buffer<T: Pod>(
        &mut self,
        ctx: &GpuContext,
        data: &[T],
        dst: &Buffer,
    ) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let total = clamp_copy(Some(bytes.len() as u64), bytes.len() as u64, dst.size());

        let mut offset = 0u64;
        while offset < total {
            let lease = self.staging.acquire(ctx)?;
            let chunk = (total - offset).min(lease.size());
            lease.write(&bytes[offset as usize..(offset + chunk) as usize], 0)?;

            let region = vk::BufferCopy::default()
                .src_offset(0)
                .dst_offset(offset)
                .size(chunk);
            device.cmd_copy_buffer(cmd, lease.handle(), dst.handle(), &[region]);
            self.leases.push(lease);
            offset += chunk;
        }
        Ok(())
    }

    /// Record a buffer-to-buffer copy. `amount` defaults to the source
    /// size and is clamped to what both buffers can hold past their
    /// offsets.
    ///
    /// # Safety
    /// Both buffers must stay alive until the chain's work completes.
    pub unsafe fn copy_buffer(
        &mut self,
        ctx: &GpuContext,
        src: &Buffer,
        dst: &Buffer,
        amount: Option<u64>,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.record(ctx)?;
        let size = clamp_copy(
            amount,
            src.size().saturating_sub(src_offset),
            dst.size().saturating_sub(dst_offset),
        );
        if size == 0 {
            return Ok(());
        }

        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        ctx.device().cmd_copy_buffer(
            self.slots[self.current].cmd,
            src.handle(),
            dst.handle(),
            &[region],
        );
        Ok(())
    }

    /// Record a readback of buffer contents into a staging lease.
    ///
    /// The lease stays held by the returned [`Readback`] until it is
    /// resolved. Reads are limited to one staging buffer; larger requests
    /// are clamped.
    ///
    /// # Safety
    /// The source must stay alive until the chain's work completes.
    pub unsafe fn read_buffer(
        &mut self,
        ctx: &GpuContext,
        src: &Buffer,
        amount: Option<u64>,
        src_offset: u64,
    ) -> Result<Readback> {
        self.record(ctx)?;
        let lease = self.staging.acquire(ctx)?;
        let size = clamp_copy(
            amount,
            src.size().saturating_sub(src_offset),
            lease.size(),
        );

        if size > 0 {
            let region = vk::BufferCopy::default()
                .src_offset(src_offset)
                .dst_offset(0)
                .size(size);
            ctx.device().cmd_copy_buffer(
                self.slots[self.current].cmd,
                src.handle(),
                lease.handle(),
                &[region],
            );
        }
        Ok(Readback { lease, len: size })
    }

    /// Upload host data into an image over its full extent. The image is
    /// reverted to its previous layout afterwards.
    ///
    /// The data must cover at least the image's tightly packed byte
    /// size; a full-extent copy cannot be clamped.
    ///
    /// # Safety
    /// The image must stay alive until the chain's work completes.
    pub unsafe fn copy_to_image<T: Pod>(
        &mut self,
        ctx: &GpuContext,
        data: &[T],
        dst: &mut Image,
    ) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let image_bytes = image_byte_size(dst.format(), dst.extent(), dst.layers())?;
        if image_bytes > self.staging.buffer_size() {
            return Err(GpuError::InvalidState(format!(
                "image upload of {image_bytes} bytes exceeds staging buffer size"
            )));
        }
        if (bytes.len() as u64) < image_bytes {
            return Err(GpuError::InvalidState(format!(
                "upload holds {} bytes, image needs {image_bytes}",
                bytes.len()
            )));
        }

        let lease = self.staging.acquire(ctx)?;
        lease.write(&bytes[..image_bytes as usize], 0)?;

        dst.record_transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let region = buffer_image_region(dst.extent(), dst.layers());
        device.cmd_copy_buffer_to_image(
            cmd,
            lease.handle(),
            dst.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        dst.record_revert(device, cmd);
        self.leases.push(lease);
        Ok(())
    }

    /// Record a readback of a full image into a staging lease. The image
    /// is transitioned to `TRANSFER_SRC_OPTIMAL` and reverted afterwards.
    ///
    /// # Safety
    /// The image must stay alive until the chain's work completes.
    pub unsafe fn read_image(&mut self, ctx: &GpuContext, src: &mut Image) -> Result<Readback> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        let size = image_byte_size(src.format(), src.extent(), src.layers())?;
        if size > self.staging.buffer_size() {
            return Err(GpuError::InvalidState(format!(
                "image readback of {size} bytes exceeds staging buffer size"
            )));
        }
        let lease = self.staging.acquire(ctx)?;

        src.record_transition(device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let region = buffer_image_region(src.extent(), src.layers());
        device.cmd_copy_image_to_buffer(
            cmd,
            src.handle(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            lease.handle(),
            &[region],
        );
        src.record_revert(device, cmd);

        Ok(Readback { lease, len: size })
    }

    /// Record an image-to-image copy over the smaller of the two extents
    /// and layer counts. Both images are reverted to their previous
    /// layouts afterwards.
    ///
    /// # Safety
    /// Both images must stay alive until the chain's work completes.
    pub unsafe fn copy_image(
        &mut self,
        ctx: &GpuContext,
        src: &mut Image,
        dst: &mut Image,
    ) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        src.record_transition(device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        dst.record_transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let extent = vk::Extent3D {
            width: src.extent().width.min(dst.extent().width),
            height: src.extent().height.min(dst.extent().height),
            depth: 1,
        };
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(src.layers().min(dst.layers()));
        let region = vk::ImageCopy::default()
            .src_subresource(layers)
            .dst_subresource(layers)
            .extent(extent);
        device.cmd_copy_image(
            cmd,
            src.handle(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        src.record_revert(device, cmd);
        dst.record_revert(device, cmd);
        Ok(())
    }

    /// Record a buffer-to-image copy over the image's full extent. The
    /// image is reverted to its previous layout afterwards.
    ///
    /// The buffer must hold at least the image's tightly packed byte
    /// size; a full-extent copy cannot be clamped.
    ///
    /// # Safety
    /// Both resources must stay alive until the chain's work completes.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        ctx: &GpuContext,
        src: &Buffer,
        dst: &mut Image,
    ) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        let size = image_byte_size(dst.format(), dst.extent(), dst.layers())?;
        if src.size() < size {
            return Err(GpuError::InvalidState(format!(
                "source buffer holds {} bytes, image needs {size}",
                src.size()
            )));
        }

        dst.record_transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let region = buffer_image_region(dst.extent(), dst.layers());
        device.cmd_copy_buffer_to_image(
            cmd,
            src.handle(),
            dst.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        dst.record_revert(device, cmd);
        Ok(())
    }

    /// Record an image-to-buffer copy over the image's full extent. The
    /// image is reverted to its previous layout afterwards.
    ///
    /// # Safety
    /// Both resources must stay alive until the chain's work completes.
    pub unsafe fn copy_image_to_buffer(
        &mut self,
        ctx: &GpuContext,
        src: &mut Image,
        dst: &Buffer,
    ) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        let size = image_byte_size(src.format(), src.extent(), src.layers())?;
        if dst.size() < size {
            return Err(GpuError::InvalidState(format!(
                "destination buffer holds {} bytes, image needs {size}",
                dst.size()
            )));
        }

        src.record_transition(device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let region = buffer_image_region(src.extent(), src.layers());
        device.cmd_copy_image_to_buffer(
            cmd,
            src.handle(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.handle(),
            &[region],
        );
        src.record_revert(device, cmd);
        Ok(())
    }

    /// Record a layout transition.
    ///
    /// # Safety
    /// The image must stay alive until the chain's work completes.
    pub unsafe fn transition(
        &mut self,
        ctx: &GpuContext,
        image: &mut Image,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.record(ctx)?;
        image.record_transition(ctx.device(), self.slots[self.current].cmd, layout);
        Ok(())
    }

    /// Record a transition back to the image's previous layout.
    ///
    /// # Safety
    /// The image must stay alive until the chain's work completes.
    pub unsafe fn revert_layout(&mut self, ctx: &GpuContext, image: &mut Image) -> Result<()> {
        self.record(ctx)?;
        image.record_revert(ctx.device(), self.slots[self.current].cmd);
        Ok(())
    }

    /// Record a full-image clear. The image ends in
    /// `TRANSFER_DST_OPTIMAL`.
    ///
    /// # Safety
    /// The image must stay alive until the chain's work completes.
    pub unsafe fn clear_image(
        &mut self,
        ctx: &GpuContext,
        image: &mut Image,
        color: [f32; 4],
    ) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;

        image.record_transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(image.layers());
        device.cmd_clear_color_image(
            cmd,
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &vk::ClearColorValue { float32: color },
            &[range],
        );
        Ok(())
    }

    /// Attach or detach the target the draw operations render into.
    pub fn set_render_target(&mut self, target: Option<RenderTarget>) {
        self.render_target = target;
    }

    /// Record a pipeline bind.
    ///
    /// # Safety
    /// The pipeline must stay alive until the chain's work completes.
    pub unsafe fn bind_pipeline(
        &mut self,
        ctx: &GpuContext,
        pipeline: &PipelineHandle,
    ) -> Result<()> {
        self.record(ctx)?;
        ctx.device().cmd_bind_pipeline(
            self.slots[self.current].cmd,
            pipeline.bind_point,
            pipeline.pipeline,
        );
        Ok(())
    }

    /// Record a descriptor set bind for set index 0.
    ///
    /// # Safety
    /// The set and pipeline must stay alive until the chain's work
    /// completes.
    pub unsafe fn bind_descriptor_set(
        &mut self,
        ctx: &GpuContext,
        pipeline: &PipelineHandle,
        set: vk::DescriptorSet,
    ) -> Result<()> {
        self.record(ctx)?;
        ctx.device().cmd_bind_descriptor_sets(
            self.slots[self.current].cmd,
            pipeline.bind_point,
            pipeline.layout,
            0,
            &[set],
            &[],
        );
        Ok(())
    }

    /// Record a vertex buffer bind at binding 0.
    ///
    /// # Safety
    /// The buffer must stay alive until the chain's work completes.
    pub unsafe fn bind_vertex_buffer(&mut self, ctx: &GpuContext, buffer: &Buffer) -> Result<()> {
        self.record(ctx)?;
        ctx.device().cmd_bind_vertex_buffers(
            self.slots[self.current].cmd,
            0,
            &[buffer.handle()],
            &[0],
        );
        Ok(())
    }

    /// Record an index buffer bind.
    ///
    /// # Safety
    /// The buffer must stay alive until the chain's work completes.
    pub unsafe fn bind_index_buffer(
        &mut self,
        ctx: &GpuContext,
        buffer: &Buffer,
        index_type: vk::IndexType,
    ) -> Result<()> {
        self.record(ctx)?;
        ctx.device()
            .cmd_bind_index_buffer(self.slots[self.current].cmd, buffer.handle(), 0, index_type);
        Ok(())
    }

    /// Record a push constant update.
    ///
    /// # Safety
    /// The pipeline must stay alive until the chain's work completes.
    pub unsafe fn push_constants(
        &mut self,
        ctx: &GpuContext,
        pipeline: &PipelineHandle,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) -> Result<()> {
        self.record(ctx)?;
        ctx.device().cmd_push_constants(
            self.slots[self.current].cmd,
            pipeline.layout,
            stages,
            0,
            data,
        );
        Ok(())
    }

    /// Record a draw. Requires a render target; rendering begins lazily
    /// on the first draw after a submit or target change.
    ///
    /// # Safety
    /// The target's image view must stay alive until the chain's work
    /// completes.
    pub unsafe fn draw(
        &mut self,
        ctx: &GpuContext,
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<()> {
        self.record(ctx)?;
        self.ensure_rendering(ctx.device())?;
        ctx.device()
            .cmd_draw(self.slots[self.current].cmd, vertex_count, instance_count, 0, 0);
        Ok(())
    }

    /// Record an indexed draw. Same contract as [`draw`](Self::draw).
    ///
    /// # Safety
    /// Same contract as [`draw`](Self::draw).
    pub unsafe fn draw_indexed(
        &mut self,
        ctx: &GpuContext,
        index_count: u32,
        instance_count: u32,
    ) -> Result<()> {
        self.record(ctx)?;
        self.ensure_rendering(ctx.device())?;
        ctx.device().cmd_draw_indexed(
            self.slots[self.current].cmd,
            index_count,
            instance_count,
            0,
            0,
            0,
        );
        Ok(())
    }

    /// Record a compute dispatch. Closes any open rendering first.
    ///
    /// # Safety
    /// The bound pipeline and sets must stay alive until the chain's
    /// work completes.
    pub unsafe fn dispatch(&mut self, ctx: &GpuContext, x: u32, y: u32, z: u32) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        let cmd = self.slots[self.current].cmd;
        if self.rendering_open {
            device.cmd_end_rendering(cmd);
            self.rendering_open = false;
        }
        device.cmd_dispatch(cmd, x, y, z);
        Ok(())
    }

    /// Submit recorded work. A no-op when nothing was recorded.
    ///
    /// The submission waits for the chain's previous submission via
    /// semaphore, so chain order matches submit order without blocking
    /// the CPU.
    ///
    /// # Safety
    /// Everything referenced by recorded commands must stay alive until
    /// [`synchronize`](Self::synchronize) or the slot is reused.
    pub unsafe fn submit(&mut self, ctx: &GpuContext) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        let device = ctx.device();
        self.finish_recording(device)?;
        let slot = &mut self.slots[self.current];

        let mut waits = Vec::with_capacity(1);
        if let Some(semaphore) = self.pending_wait {
            waits.push(semaphore);
        }
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];

        self.queue.submit(
            device,
            &[slot.cmd],
            &waits,
            &stages,
            &[slot.finished],
            slot.fence,
        )?;
        slot.in_flight = true;
        slot.leases = std::mem::take(&mut self.leases);
        self.pending_wait = Some(slot.finished);
        self.advance();
        Ok(())
    }

    /// Submit recorded work wired into a frame's synchronization bundle:
    /// waits on the bundle's collected waits (plus the chain's own
    /// ordering semaphore) and signals the bundle's semaphores.
    ///
    /// Records an empty submission when nothing was recorded, so the
    /// bundle's semaphores still fire.
    ///
    /// # Safety
    /// Same contract as [`submit`](Self::submit); the bundle's handles
    /// must be valid.
    pub unsafe fn submit_frame(&mut self, ctx: &GpuContext, sync: &Synchronization) -> Result<()> {
        self.record(ctx)?;
        let device = ctx.device();
        self.finish_recording(device)?;
        let slot = &mut self.slots[self.current];

        let mut waits = sync.wait_semaphores().to_vec();
        if let Some(semaphore) = self.pending_wait.take() {
            waits.push(semaphore);
        }
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];

        self.queue.submit(
            device,
            &[slot.cmd],
            &waits,
            &stages,
            sync.signal_semaphores(),
            slot.fence,
        )?;
        slot.in_flight = true;
        slot.leases = std::mem::take(&mut self.leases);
        self.advance();
        Ok(())
    }

    /// Block until every submission of this chain has completed, then
    /// release held staging leases and settle the ring's fences.
    ///
    /// # Safety
    /// The context must be the one the chain was created with.
    pub unsafe fn synchronize(&mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        self.queue.wait_idle(device)?;
        for slot in &mut self.slots {
            if slot.in_flight {
                reset_fence(device, slot.fence)?;
                slot.in_flight = false;
            }
            slot.leases.clear();
        }
        Ok(())
    }

    /// Drop all recorded and completed state, resetting the ring. The
    /// parked ordering semaphore survives; the next submission still
    /// consumes its signal.
    ///
    /// # Safety
    /// Call only after [`synchronize`](Self::synchronize); in-flight
    /// submissions must not exist.
    pub unsafe fn reset(&mut self, ctx: &GpuContext) -> Result<()> {
        ctx.device()
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        for slot in &mut self.slots {
            slot.in_flight = false;
            slot.leases.clear();
        }
        self.leases.clear();
        self.recording = false;
        self.rendering_open = false;
        // pending_wait stays parked: its semaphore is still signaled, and
        // only the next submission's wait may unsignal it. Dropping it
        // here would double-signal once the ring wraps.
        self.current = 0;
        Ok(())
    }

    /// Destroy the ring and its primitives.
    ///
    /// # Safety
    /// Call only after [`synchronize`](Self::synchronize).
    pub unsafe fn destroy(&mut self, ctx: &GpuContext) {
        let device = ctx.device();
        self.leases.clear();
        for slot in &mut self.slots {
            device.destroy_fence(slot.fence, None);
            device.destroy_semaphore(slot.finished, None);
        }
        self.slots.clear();
        if self.pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.pool, None);
            self.pool = vk::CommandPool::null();
        }
        self.pending_wait = None;
        self.recording = false;
    }

    unsafe fn finish_recording(&mut self, device: &ash::Device) -> Result<()> {
        let cmd = self.slots[self.current].cmd;
        if self.rendering_open {
            device.cmd_end_rendering(cmd);
            self.rendering_open = false;
        }
        device.end_command_buffer(cmd)?;
        self.recording = false;
        Ok(())
    }

    unsafe fn ensure_rendering(&mut self, device: &ash::Device) -> Result<()> {
        if self.rendering_open {
            return Ok(());
        }
        let target = self.render_target.ok_or_else(|| {
            GpuError::InvalidState("draw recorded without a render target".to_string())
        })?;

        let mut color = vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .store_op(vk::AttachmentStoreOp::STORE);
        color = if let Some(clear) = target.clear {
            color
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue { float32: clear },
                })
        } else {
            color.load_op(vk::AttachmentLoadOp::LOAD)
        };
        let color_attachments = [color];

        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        device.cmd_begin_rendering(self.slots[self.current].cmd, &rendering_info);
        self.rendering_open = true;
        Ok(())
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }
}

/// A recorded readback parked in a staging lease.
///
/// The lease is held until the readback is resolved, so no other caller
/// can overwrite the staging bytes in the meantime.
pub struct Readback {
    lease: StagingLease,
    len: u64,
}

impl Readback {
    /// Bytes the readback covers.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the read bytes into `out`, releasing the lease.
    ///
    /// Call only after the chain's work has completed (synchronize or
    /// wait on the frame fence); resolving earlier reads whatever the
    /// GPU has written so far. Returns the number of bytes copied.
    pub fn resolve<T: Pod>(self, out: &mut [T]) -> Result<u64> {
        let region = self.lease.region();
        region.sync_to_host()?;

        let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        let count = (out_bytes.len() as u64).min(self.len);
        region.read_host(&mut out_bytes[..count as usize], 0)
    }
}

/// Clamp a requested copy size to what source and destination can hold.
fn clamp_copy(requested: Option<u64>, src_available: u64, dst_available: u64) -> u64 {
    let limit = src_available.min(dst_available);
    let wanted = requested.unwrap_or(limit);
    if wanted > limit {
        tracing::debug!(wanted, limit, "copy clamped");
    }
    wanted.min(limit)
}

/// Byte size of a tightly packed full-image copy covering every layer.
fn image_byte_size(format: vk::Format, extent: vk::Extent3D, layers: u32) -> Result<u64> {
    let texel = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        other => {
            return Err(GpuError::InvalidState(format!(
                "unsupported transfer format {other:?}"
            )))
        }
    };
    Ok(u64::from(extent.width)
        * u64::from(extent.height)
        * u64::from(extent.depth)
        * u64::from(layers.max(1))
        * texel)
}

fn buffer_image_region(extent: vk::Extent3D, layers: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(layers.max(1)),
        )
        .image_extent(extent)
}

unsafe fn destroy_slots(device: &ash::Device, slots: &mut Vec<ChainSlot>, pool: vk::CommandPool) {
    for slot in slots.drain(..) {
        device.destroy_fence(slot.fence, None);
        device.destroy_semaphore(slot.finished, None);
    }
    device.destroy_command_pool(pool, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_defaults_to_the_smaller_side() {
        assert_eq!(clamp_copy(None, 100, 60), 60);
        assert_eq!(clamp_copy(None, 40, 60), 40);
    }

    #[test]
    fn clamp_caps_explicit_requests() {
        assert_eq!(clamp_copy(Some(500), 100, 200), 100);
        assert_eq!(clamp_copy(Some(30), 100, 200), 30);
        assert_eq!(clamp_copy(Some(10), 0, 200), 0);
    }

    #[test]
    fn image_sizes_follow_texel_width() {
        let extent = vk::Extent3D {
            width: 16,
            height: 8,
            depth: 1,
        };
        assert_eq!(
            image_byte_size(vk::Format::R8G8B8A8_UNORM, extent, 1).unwrap(),
            512
        );
        assert_eq!(image_byte_size(vk::Format::R8_UNORM, extent, 1).unwrap(), 128);
        assert!(image_byte_size(vk::Format::BC1_RGB_UNORM_BLOCK, extent, 1).is_err());
    }

    #[test]
    fn layered_images_scale_sizes_and_copy_regions() {
        let extent = vk::Extent3D {
            width: 16,
            height: 8,
            depth: 1,
        };
        assert_eq!(
            image_byte_size(vk::Format::R8G8B8A8_UNORM, extent, 3).unwrap(),
            3 * 512
        );

        let region = buffer_image_region(extent, 3);
        assert_eq!(region.image_subresource.base_array_layer, 0);
        assert_eq!(region.image_subresource.layer_count, 3);
        assert_eq!(region.image_extent, extent);
    }
}
