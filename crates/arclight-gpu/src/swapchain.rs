//! Swapchain management and frame pacing.
//!
//! The swapchain owns one [`Synchronization`] bundle per frame slot and
//! a ring that tracks which slots still have an acquisition in flight.
//! Acquiring a slot whose previous acquisition has not completed blocks
//! on that slot's fence, so at most `image_count` frames are ever
//! outstanding. Acquired images are presented in acquisition order.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::surface::SurfaceContext;
use crate::sync::Synchronization;
use ash::vk;
use std::collections::VecDeque;

/// Ticket for one acquired swapchain image.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Frame slot whose synchronization bundle covers this frame.
    pub slot: usize,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
}

/// Presentable swapchain with per-slot synchronization.
pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<Image>,
    syncs: Vec<Synchronization>,
    ring: PacingRing,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    vsync: bool,
    desired_width: u32,
    desired_height: u32,
    needs_recreate: bool,
}

impl Swapchain {
    /// Create a swapchain for a surface.
    ///
    /// # Safety
    /// The context and surface must be valid and outlive the swapchain.
    pub unsafe fn new(
        ctx: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let caps = surface.capabilities(ctx)?;
        let format = select_surface_format(&caps.formats);
        let present_mode = select_present_mode(&caps.present_modes, vsync);
        let extent = calculate_extent(&caps.capabilities, width, height);

        let (swapchain, images) = create_swapchain_images(
            ctx,
            surface,
            &caps.capabilities,
            format,
            present_mode,
            extent,
        )?;
        let syncs = match create_frame_syncs(ctx.device(), images.len()) {
            Ok(syncs) => syncs,
            Err(e) => {
                destroy_swapchain_images(ctx, surface, swapchain, images, Vec::new());
                return Err(e);
            }
        };

        tracing::debug!(
            images = images.len(),
            width = extent.width,
            height = extent.height,
            ?present_mode,
            "Created swapchain"
        );

        let ring = PacingRing::new(images.len());
        Ok(Self {
            swapchain,
            images,
            syncs,
            ring,
            format,
            extent,
            vsync,
            desired_width: width,
            desired_height: height,
            needs_recreate: false,
        })
    }

    /// Pixel format of the swapchain images.
    #[must_use]
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Current swapchain extent.
    #[must_use]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of swapchain images (and frame slots).
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// The image behind an acquired index.
    #[must_use]
    pub fn image_mut(&mut self, image_index: u32) -> &mut Image {
        &mut self.images[image_index as usize]
    }

    /// Synchronization bundle of a frame slot. Pass this to
    /// `CommandChain::submit_frame` for the slot returned by
    /// [`acquire`](Self::acquire).
    #[must_use]
    pub fn sync(&self, slot: usize) -> &Synchronization {
        &self.syncs[slot]
    }

    /// Mutable access to a frame slot's bundle, for collecting extra
    /// waits into the frame submission.
    pub fn sync_mut(&mut self, slot: usize) -> &mut Synchronization {
        &mut self.syncs[slot]
    }

    /// Frames acquired but not yet presented.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.ring.outstanding()
    }

    /// Request a new size. Applied on the next [`acquire`](Self::acquire).
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == self.desired_width && height == self.desired_height {
            return;
        }
        self.desired_width = width;
        self.desired_height = height;
        self.needs_recreate = true;
    }

    /// Acquire the next image, pacing against the slot's previous
    /// acquisition.
    ///
    /// Waits for the slot's availability fence when the ring has wrapped,
    /// signals the slot's semaphore and fence through the acquisition,
    /// and moves the semaphore onto the slot's wait list so the frame
    /// submission waits for image availability. A stale swapchain is
    /// recreated and the acquire retried.
    ///
    /// # Safety
    /// The context and surface must be the ones the swapchain was
    /// created with.
    pub unsafe fn acquire(
        &mut self,
        ctx: &GpuContext,
        surface: &SurfaceContext,
    ) -> Result<FrameSlot> {
        let device = ctx.device();
        if self.needs_recreate {
            self.recreate(ctx, surface)?;
        }

        loop {
            let slot = self.ring.current();
            if self.ring.is_armed(slot) {
                self.syncs[slot].wait_and_reset_fence(device)?;
                self.ring.disarm(slot);
            }

            let semaphore = self.syncs[slot].first_signal().ok_or_else(|| {
                GpuError::InvalidState("frame slot has no signal semaphore".to_string())
            })?;
            let fence = self.syncs[slot]
                .signal_fence()
                .unwrap_or_else(vk::Fence::null);

            let acquired = surface.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                fence,
            );
            match acquired {
                Ok((image_index, suboptimal)) => {
                    if suboptimal {
                        // The acquire signaled; arm the slot so recreate
                        // settles its fence before the teardown.
                        tracing::debug!("Swapchain suboptimal on acquire, recreating");
                        self.ring.note_acquired(image_index);
                        self.recreate(ctx, surface)?;
                        continue;
                    }
                    self.ring.note_acquired(image_index);
                    self.syncs[slot].wait_on_signals();
                    return Ok(FrameSlot { slot, image_index });
                }
                // No image was acquired and nothing was signaled.
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.recreate(ctx, surface)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Present the oldest acquired image, waiting its slot's render
    /// semaphores.
    ///
    /// A stale swapchain is recreated and the frame skipped; this is not
    /// an error.
    ///
    /// # Safety
    /// Same contract as [`acquire`](Self::acquire).
    pub unsafe fn present(&mut self, ctx: &GpuContext, surface: &SurfaceContext) -> Result<()> {
        let Some((slot, image_index)) = self.ring.pop_presentable() else {
            return Err(GpuError::InvalidState(
                "present without a matching acquire".to_string(),
            ));
        };

        let waits = self.syncs[slot].signal_semaphores().to_vec();
        let stale = ctx.graphics_queue().present(
            &surface.swapchain_loader,
            self.swapchain,
            image_index,
            &waits,
        )?;

        if stale {
            self.recreate(ctx, surface)?;
            return Ok(());
        }
        self.syncs[slot].clear_waits();
        Ok(())
    }

    /// Tear the swapchain down and build it against current surface
    /// capabilities. Outstanding acquisitions are drained first; the ring
    /// starts over empty.
    ///
    /// # Safety
    /// Same contract as [`acquire`](Self::acquire).
    pub unsafe fn recreate(&mut self, ctx: &GpuContext, surface: &SurfaceContext) -> Result<()> {
        let device = ctx.device();

        // Settle pending acquire signals before retiring the handles.
        for slot in 0..self.ring.slot_count() {
            if self.ring.is_armed(slot) {
                self.syncs[slot].wait_and_reset_fence(device)?;
                self.ring.disarm(slot);
            }
        }
        ctx.wait_idle()?;

        let images = std::mem::take(&mut self.images);
        let syncs = std::mem::take(&mut self.syncs);
        destroy_swapchain_images(ctx, surface, self.swapchain, images, syncs);
        self.swapchain = vk::SwapchainKHR::null();

        let caps = surface.capabilities(ctx)?;
        self.format = select_surface_format(&caps.formats);
        let present_mode = select_present_mode(&caps.present_modes, self.vsync);
        self.extent = calculate_extent(&caps.capabilities, self.desired_width, self.desired_height);

        let (swapchain, images) = create_swapchain_images(
            ctx,
            surface,
            &caps.capabilities,
            self.format,
            present_mode,
            self.extent,
        )?;
        let syncs = match create_frame_syncs(device, images.len()) {
            Ok(syncs) => syncs,
            Err(e) => {
                destroy_swapchain_images(ctx, surface, swapchain, images, Vec::new());
                return Err(e);
            }
        };

        tracing::debug!(
            width = self.extent.width,
            height = self.extent.height,
            "Recreated swapchain"
        );

        self.swapchain = swapchain;
        self.images = images;
        self.syncs = syncs;
        self.ring = PacingRing::new(self.images.len());
        self.needs_recreate = false;
        Ok(())
    }

    /// Destroy the swapchain, its views, and its frame bundles.
    ///
    /// # Safety
    /// Call only after the device is idle.
    pub unsafe fn destroy(&mut self, ctx: &GpuContext, surface: &SurfaceContext) {
        let device = ctx.device();
        for slot in 0..self.ring.slot_count() {
            if self.ring.is_armed(slot) {
                let _ = self.syncs[slot].wait_and_reset_fence(device);
            }
        }
        let images = std::mem::take(&mut self.images);
        let syncs = std::mem::take(&mut self.syncs);
        destroy_swapchain_images(ctx, surface, self.swapchain, images, syncs);
        self.swapchain = vk::SwapchainKHR::null();
        self.ring = PacingRing::new(0);
    }
}

/// Slot bookkeeping behind the swapchain's pacing.
///
/// A slot is *armed* while its acquisition fence may still be pending;
/// acquired images queue up in FIFO order until presented.
struct PacingRing {
    armed: Vec<bool>,
    acquired: VecDeque<(usize, u32)>,
    current: usize,
}

impl PacingRing {
    fn new(slots: usize) -> Self {
        Self {
            armed: vec![false; slots],
            acquired: VecDeque::with_capacity(slots),
            current: 0,
        }
    }

    fn slot_count(&self) -> usize {
        self.armed.len()
    }

    fn current(&self) -> usize {
        self.current
    }

    fn is_armed(&self, slot: usize) -> bool {
        self.armed[slot]
    }

    fn disarm(&mut self, slot: usize) {
        self.armed[slot] = false;
    }

    /// Mark the current slot acquired and advance. Returns the slot.
    fn note_acquired(&mut self, image_index: u32) -> usize {
        let slot = self.current;
        self.armed[slot] = true;
        self.acquired.push_back((slot, image_index));
        self.current = (self.current + 1) % self.armed.len();
        slot
    }

    /// Oldest acquired frame, in acquisition order.
    fn pop_presentable(&mut self) -> Option<(usize, u32)> {
        self.acquired.pop_front()
    }

    fn outstanding(&self) -> usize {
        self.acquired.len()
    }
}

unsafe fn create_swapchain_images(
    ctx: &GpuContext,
    surface: &SurfaceContext,
    surface_capabilities: &vk::SurfaceCapabilitiesKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
) -> Result<(vk::SwapchainKHR, Vec<Image>)> {
    // Determine image count
    let mut image_count = surface_capabilities.min_image_count + 1;
    if surface_capabilities.max_image_count > 0
        && image_count > surface_capabilities.max_image_count
    {
        image_count = surface_capabilities.max_image_count;
    }

    let queue_families = [ctx.graphics_queue().family()];
    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface.surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .queue_family_indices(&queue_families)
        .pre_transform(surface_capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain = surface
        .swapchain_loader
        .create_swapchain(&create_info, None)
        .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

    let handles = match surface.swapchain_loader.get_swapchain_images(swapchain) {
        Ok(handles) => handles,
        Err(e) => {
            surface.swapchain_loader.destroy_swapchain(swapchain, None);
            return Err(e.into());
        }
    };

    let mut images = Vec::with_capacity(handles.len());
    for handle in handles {
        match Image::wrap_swapchain_image(ctx.device(), handle, surface_format.format, extent) {
            Ok(image) => images.push(image),
            Err(e) => {
                destroy_swapchain_images(ctx, surface, swapchain, images, Vec::new());
                return Err(e);
            }
        }
    }
    Ok((swapchain, images))
}

unsafe fn create_frame_syncs(device: &ash::Device, count: usize) -> Result<Vec<Synchronization>> {
    let mut syncs = Vec::with_capacity(count);
    for _ in 0..count {
        match Synchronization::new(device, 1, true) {
            Ok(sync) => syncs.push(sync),
            Err(e) => {
                for mut sync in syncs {
                    sync.destroy(device);
                }
                return Err(e);
            }
        }
    }
    Ok(syncs)
}

unsafe fn destroy_swapchain_images(
    ctx: &GpuContext,
    surface: &SurfaceContext,
    swapchain: vk::SwapchainKHR,
    images: Vec<Image>,
    syncs: Vec<Synchronization>,
) {
    let device = ctx.device();
    for mut image in images {
        let _ = image.destroy(device);
    }
    for mut sync in syncs {
        sync.destroy(device);
    }
    if swapchain != vk::SwapchainKHR::null() {
        surface.swapchain_loader.destroy_swapchain(swapchain, None);
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // Prefer SRGB
    for format in available {
        if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }

    // Fall back to first available
    available[0]
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // FIFO is always supported
        vk::PresentModeKHR::FIFO
    } else {
        for &mode in available {
            if mode == vk::PresentModeKHR::MAILBOX {
                return mode;
            }
        }
        for &mode in available {
            if mode == vk::PresentModeKHR::IMMEDIATE {
                return mode;
            }
        }
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_order_matches_acquisition_order() {
        let mut ring = PacingRing::new(3);
        ring.note_acquired(2);
        ring.note_acquired(0);
        ring.note_acquired(1);

        assert_eq!(ring.pop_presentable(), Some((0, 2)));
        assert_eq!(ring.pop_presentable(), Some((1, 0)));
        assert_eq!(ring.pop_presentable(), Some((2, 1)));
        assert_eq!(ring.pop_presentable(), None);
    }

    #[test]
    fn a_full_ring_parks_on_the_oldest_slot() {
        let mut ring = PacingRing::new(3);
        for image in 0..3 {
            assert!(!ring.is_armed(ring.current()));
            ring.note_acquired(image);
        }
        // Ring wrapped; slot 0 still has its acquisition outstanding.
        assert_eq!(ring.current(), 0);
        assert!(ring.is_armed(0));
        assert_eq!(ring.outstanding(), 3);
    }

    #[test]
    fn outstanding_frames_never_exceed_the_slot_count() {
        let mut ring = PacingRing::new(2);
        for frame in 0..10u32 {
            let slot = ring.current();
            if ring.is_armed(slot) {
                // Modeling the fence wait of a paced acquire.
                ring.disarm(slot);
            }
            ring.note_acquired(frame % 2);
            assert!(ring.outstanding() <= 2);
            if ring.outstanding() == 2 {
                ring.pop_presentable();
            }
        }
    }

    #[test]
    fn srgb_formats_win_over_the_first_entry() {
        let linear = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(select_surface_format(&[linear, srgb]).format, srgb.format);
        assert_eq!(select_surface_format(&[linear]).format, linear.format);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&modes, false),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            select_present_mode(
                &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                false
            ),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::MAILBOX], true),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn fixed_surface_extents_are_kept() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let extent = calculate_extent(&caps, 1920, 1080);
        assert_eq!(extent.width, 1280);

        caps.current_extent.width = u32::MAX;
        caps.min_image_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1600,
            height: 900,
        };
        let extent = calculate_extent(&caps, 1920, 1080);
        assert_eq!(extent.width, 1600);
        assert_eq!(extent.height, 900);
    }
}
