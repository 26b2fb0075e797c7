//! Vulkan resource, transfer, and synchronization layer for Arclight.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection
//! - Offset-tracking memory regions with host mirrors
//! - Buffers and layout-tracking images bound to regions
//! - A leased staging pool and command chains for transfers
//! - Swapchain handling with frame pacing

pub mod buffer;
pub mod capabilities;
pub mod chain;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use chain::{CommandChain, Readback, RenderTarget};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_sampled_image, write_storage_buffer, write_storage_image, write_uniform_buffer,
    DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result, Severity};
pub use image::{Image, ImageConfig};
pub use memory::{find_memory_type, MemoryRegion};
pub use pipeline::{ComputePipeline, PipelineHandle};
pub use queue::{Queue, QueueRole};
pub use staging::{StagingLease, StagingPool};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{FrameSlot, Swapchain};
pub use sync::{create_fence, create_semaphore, Synchronization};
