//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A resource does not fit in the remaining space of a memory region.
    #[error("Region exhausted: need {needed} bytes, {available} remain")]
    RegionExhausted {
        /// Bytes required by the resource.
        needed: u64,
        /// Bytes left between the region offset and the end of the allocation.
        available: u64,
    },

    /// Host-side copy requested on a region created without a host mirror.
    #[error("Memory region has no host mirror")]
    NoHostMirror,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// How bad an error is for the rest of the frame.
///
/// `Warning` errors are recoverable by the caller (retry, resize, fall back);
/// `Fatal` errors mean the device or allocation state is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational only.
    Info,
    /// Recoverable; the caller can retry or degrade.
    Warning,
    /// The device, allocation, or swapchain is unusable.
    Fatal,
}

impl GpuError {
    /// Classifies the error so callers can decide between retry and teardown.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Vulkan(result) => severity_of(*result),
            Self::NoSuitableDevice
            | Self::AllocationFailed(_)
            | Self::SurfaceCreation(_)
            | Self::ShaderCompilation(_)
            | Self::PipelineCreation(_)
            | Self::Other(_) => Severity::Fatal,
            Self::RegionExhausted { .. }
            | Self::NoHostMirror
            | Self::SwapchainCreation(_)
            | Self::InvalidState(_) => Severity::Warning,
        }
    }

    /// True for errors after which the context must be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

fn severity_of(result: vk::Result) -> Severity {
    match result {
        vk::Result::ERROR_DEVICE_LOST
        | vk::Result::ERROR_INITIALIZATION_FAILED
        | vk::Result::ERROR_OUT_OF_DATE_KHR
        | vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Severity::Fatal,
        vk::Result::SUBOPTIMAL_KHR => Severity::Info,
        _ => Severity::Warning,
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_is_fatal() {
        let err = GpuError::from(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(err.is_fatal());
    }

    #[test]
    fn stale_swapchain_is_fatal_suboptimal_is_not() {
        assert_eq!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR).severity(),
            Severity::Fatal
        );
        assert_eq!(
            GpuError::from(vk::Result::SUBOPTIMAL_KHR).severity(),
            Severity::Info
        );
    }

    #[test]
    fn exhausted_region_is_recoverable() {
        let err = GpuError::RegionExhausted {
            needed: 256,
            available: 128,
        };
        assert_eq!(err.severity(), Severity::Warning);
        assert!(!err.is_fatal());
    }

    #[test]
    fn unknown_vulkan_errors_are_warnings() {
        assert_eq!(
            GpuError::from(vk::Result::ERROR_FEATURE_NOT_PRESENT).severity(),
            Severity::Warning
        );
    }
}
