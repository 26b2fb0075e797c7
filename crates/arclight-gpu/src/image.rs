//! GPU images with tracked layout state.

use crate::context::GpuContext;
use crate::error::Result;
use crate::memory::MemoryRegion;
use ash::vk;

/// Creation parameters for a 2D or 2D-array image.
#[derive(Debug, Clone, Copy)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageConfig {
    /// A transferable color image with a single layer.
    #[must_use]
    pub fn color(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    #[must_use]
    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    #[must_use]
    pub fn layers(mut self, layers: u32) -> Self {
        self.layers = layers.max(1);
        self
    }
}

/// A Vulkan image plus its bound region and tracked layout.
///
/// The image remembers the layout it is in and the one it was in before,
/// so a transition can be reverted without the caller bookkeeping layouts.
/// Layout state advances at record time, not submit time; interleaving
/// recorded-but-unsubmitted transitions from two chains on one image is
/// the caller's error.
pub struct Image {
    handle: vk::Image,
    view: vk::ImageView,
    /// None for swapchain-owned images, which bring their own memory.
    region: Option<MemoryRegion>,
    format: vk::Format,
    extent: vk::Extent3D,
    layers: u32,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
    old_layout: vk::ImageLayout,
}

impl Image {
    /// Create an image backed by its own device-local allocation.
    ///
    /// # Safety
    /// The context must outlive the image, and the image must be
    /// destroyed before the device.
    pub unsafe fn new(ctx: &GpuContext, config: &ImageConfig) -> Result<Self> {
        let handle = create_raw_image(ctx.device(), config)?;
        let requirements = ctx.device().get_image_memory_requirements(handle);

        let region = match MemoryRegion::for_requirements(
            ctx,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        ) {
            Ok(region) => region,
            Err(e) => {
                ctx.device().destroy_image(handle, None);
                return Err(e);
            }
        };
        if let Err(e) = region.bind_image(ctx.device(), handle) {
            let _ = region.free(ctx.device());
            ctx.device().destroy_image(handle, None);
            return Err(e);
        }

        Self::finish(ctx.device(), handle, region, config)
    }

    /// Create an image inside an existing region at its current window
    /// offset. The fit check runs before any bind call.
    ///
    /// # Safety
    /// The region's allocation must outlive the image.
    pub unsafe fn bind_to_region(
        ctx: &GpuContext,
        region: &MemoryRegion,
        config: &ImageConfig,
    ) -> Result<Self> {
        let handle = create_raw_image(ctx.device(), config)?;
        if let Err(e) = region.bind_image(ctx.device(), handle) {
            ctx.device().destroy_image(handle, None);
            return Err(e);
        }

        Self::finish(ctx.device(), handle, region.shifted_view(0), config)
    }

    unsafe fn finish(
        device: &ash::Device,
        handle: vk::Image,
        region: MemoryRegion,
        config: &ImageConfig,
    ) -> Result<Self> {
        let view_type = if config.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(view_type)
            .format(config.format)
            .subresource_range(subresource_range(config.aspect, config.layers));
        let view = match device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                let _ = region.free(device);
                device.destroy_image(handle, None);
                return Err(e.into());
            }
        };

        Ok(Self {
            handle,
            view,
            region: Some(region),
            format: config.format,
            extent: vk::Extent3D {
                width: config.width,
                height: config.height,
                depth: 1,
            },
            layers: config.layers.max(1),
            aspect: config.aspect,
            layout: vk::ImageLayout::UNDEFINED,
            old_layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Wrap a swapchain-owned image. The wrapper tracks layout but never
    /// frees memory; `destroy` only drops the view.
    pub(crate) unsafe fn wrap_swapchain_image(
        device: &ash::Device,
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR, 1));
        let view = device.create_image_view(&view_info, None)?;

        Ok(Self {
            handle,
            view,
            region: None,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            layers: 1,
            aspect: vk::ImageAspectFlags::COLOR,
            layout: vk::ImageLayout::UNDEFINED,
            old_layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Raw image handle.
    #[must_use]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Full-image view.
    #[must_use]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[must_use]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[must_use]
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Number of array layers.
    #[must_use]
    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Layout the image is in once all recorded work has executed.
    #[must_use]
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Layout the image was in before the most recent transition.
    #[must_use]
    pub fn old_layout(&self) -> vk::ImageLayout {
        self.old_layout
    }

    /// The region view this image is bound into, when it owns one.
    #[must_use]
    pub fn region(&self) -> Option<&MemoryRegion> {
        self.region.as_ref()
    }

    /// Advance tracked layout state. Returns false when the image is
    /// already in the requested layout.
    fn note_transition(&mut self, new_layout: vk::ImageLayout) -> bool {
        if new_layout == self.layout {
            return false;
        }
        self.old_layout = self.layout;
        self.layout = new_layout;
        true
    }

    /// Record a layout transition barrier. Recording nothing when the
    /// image is already in `new_layout`.
    ///
    /// # Safety
    /// The command buffer must be in the recording state and belong to
    /// the same device as the image.
    pub(crate) unsafe fn record_transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) {
        let from = self.layout;
        if !self.note_transition(new_layout) {
            return;
        }

        let (src_access, src_stage) = source_masks(from);
        let (dst_access, dst_stage) = destination_masks(new_layout);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(from)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(subresource_range(self.aspect, self.layers))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    /// Record a transition back to the previous layout. A no-op when the
    /// previous layout matches the current one, or when there is no
    /// previous layout yet.
    ///
    /// # Safety
    /// Same contract as [`record_transition`](Self::record_transition).
    pub(crate) unsafe fn record_revert(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let target = self.old_layout;
        // A barrier cannot target UNDEFINED.
        if target == vk::ImageLayout::UNDEFINED {
            return;
        }
        self.record_transition(device, cmd, target);
    }

    /// Destroy the view and image, freeing the allocation when owned.
    /// Swapchain-owned images only drop their view.
    ///
    /// # Safety
    /// No GPU work may still reference the image.
    pub unsafe fn destroy(&mut self, device: &ash::Device) -> Result<()> {
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view, None);
            self.view = vk::ImageView::null();
        }
        if let Some(region) = self.region.take() {
            if self.handle != vk::Image::null() {
                device.destroy_image(self.handle, None);
            }
            region.free(device)?;
        }
        self.handle = vk::Image::null();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(width: u32, height: u32) -> Self {
        Self {
            handle: vk::Image::null(),
            view: vk::ImageView::null(),
            region: None,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            layers: 1,
            aspect: vk::ImageAspectFlags::COLOR,
            layout: vk::ImageLayout::UNDEFINED,
            old_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

fn subresource_range(aspect: vk::ImageAspectFlags, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(layers)
}

unsafe fn create_raw_image(device: &ash::Device, config: &ImageConfig) -> Result<vk::Image> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(config.format)
        .extent(vk::Extent3D {
            width: config.width,
            height: config.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(config.layers.max(1))
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(config.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let handle = device.create_image(&create_info, None)?;
    Ok(handle)
}

/// Access and stage masks for work that happened in a layout.
fn source_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Access and stage masks for work that will happen in a layout.
fn destination_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_tracks_previous_layout() {
        let mut image = Image::for_tests(4, 4);
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

        assert!(image.note_transition(vk::ImageLayout::TRANSFER_DST_OPTIMAL));
        assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image.old_layout(), vk::ImageLayout::UNDEFINED);

        assert!(image.note_transition(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        assert_eq!(image.old_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn revert_swaps_current_and_previous() {
        let mut image = Image::for_tests(4, 4);
        image.note_transition(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        // Revert is itself a transition, so the pair swaps back and forth
        image.note_transition(image.old_layout());
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(image.old_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        image.note_transition(image.old_layout());
        assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image.old_layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn transition_to_current_layout_changes_nothing() {
        let mut image = Image::for_tests(4, 4);
        image.note_transition(vk::ImageLayout::GENERAL);
        let old = image.old_layout();

        assert!(!image.note_transition(vk::ImageLayout::GENERAL));
        assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(image.old_layout(), old);
    }

    #[test]
    fn configs_default_to_a_single_layer() {
        let config = ImageConfig::color(8, 8);
        assert_eq!(config.layers, 1);

        let layered = ImageConfig::color(8, 8).layers(6);
        assert_eq!(layered.layers, 6);

        // Zero clamps up rather than producing an uncreatable image
        assert_eq!(ImageConfig::color(8, 8).layers(0).layers, 1);
    }

    #[test]
    fn subresource_ranges_span_every_layer() {
        let range = subresource_range(vk::ImageAspectFlags::COLOR, 6);
        assert_eq!(range.base_array_layer, 0);
        assert_eq!(range.layer_count, 6);
        assert_eq!(range.level_count, 1);
    }

    #[test]
    fn undefined_source_has_no_access_to_wait_on() {
        let (access, stage) = source_masks(vk::ImageLayout::UNDEFINED);
        assert_eq!(access, vk::AccessFlags::empty());
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn transfer_destination_masks_cover_transfer_writes() {
        let (access, stage) = destination_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
    }
}
