//! Synchronization primitives and per-frame bundles.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence, optionally already signaled.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence with a timeout in nanoseconds.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout: u64) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout)?;
    Ok(())
}

/// Reset a fence to the unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// A bundle of signal primitives plus the wait lists for one submission.
///
/// The bundle owns its signal semaphores and fence. The wait lists hold
/// borrowed handles collected from other bundles via [`wait_on`]; they are
/// never destroyed here and must be cleared once the handles' owners go
/// away.
///
/// [`wait_on`]: Self::wait_on
pub struct Synchronization {
    signal_semaphores: Vec<vk::Semaphore>,
    signal_fence: Option<vk::Fence>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_fences: Vec<vk::Fence>,
}

impl Synchronization {
    /// Create a bundle with `signal_count` semaphores and, optionally, an
    /// unsignaled fence.
    ///
    /// # Safety
    /// The device must be valid, and the bundle must be destroyed before
    /// the device.
    pub unsafe fn new(device: &ash::Device, signal_count: usize, with_fence: bool) -> Result<Self> {
        let mut signal_semaphores = Vec::with_capacity(signal_count);
        for _ in 0..signal_count {
            match create_semaphore(device) {
                Ok(semaphore) => signal_semaphores.push(semaphore),
                Err(e) => {
                    for semaphore in signal_semaphores {
                        device.destroy_semaphore(semaphore, None);
                    }
                    return Err(e);
                }
            }
        }

        let signal_fence = if with_fence {
            match create_fence(device, false) {
                Ok(fence) => Some(fence),
                Err(e) => {
                    for semaphore in signal_semaphores {
                        device.destroy_semaphore(semaphore, None);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            signal_semaphores,
            signal_fence,
            wait_semaphores: Vec::new(),
            wait_fences: Vec::new(),
        })
    }

    /// Semaphores a submission using this bundle signals.
    #[must_use]
    pub fn signal_semaphores(&self) -> &[vk::Semaphore] {
        &self.signal_semaphores
    }

    /// The first signal semaphore, when the bundle has any.
    #[must_use]
    pub fn first_signal(&self) -> Option<vk::Semaphore> {
        self.signal_semaphores.first().copied()
    }

    /// The fence signaled alongside the semaphores.
    #[must_use]
    pub fn signal_fence(&self) -> Option<vk::Fence> {
        self.signal_fence
    }

    /// Semaphores a submission using this bundle waits on.
    #[must_use]
    pub fn wait_semaphores(&self) -> &[vk::Semaphore] {
        &self.wait_semaphores
    }

    /// Fences collected for CPU-side waits.
    #[must_use]
    pub fn wait_fences(&self) -> &[vk::Fence] {
        &self.wait_fences
    }

    /// Make this bundle's submission wait for everything `other` signals.
    pub fn wait_on(&mut self, other: &Synchronization) {
        self.wait_semaphores.extend_from_slice(&other.signal_semaphores);
        if let Some(fence) = other.signal_fence {
            self.wait_fences.push(fence);
        }
    }

    /// Move this bundle's own signal semaphores onto its wait list, so
    /// the next submission consumes what a previous operation signaled.
    pub fn wait_on_signals(&mut self) {
        self.wait_semaphores.extend_from_slice(&self.signal_semaphores);
    }

    /// Drop all collected waits.
    pub fn clear_waits(&mut self) {
        self.wait_semaphores.clear();
        self.wait_fences.clear();
    }

    /// Block on every collected wait fence, then drop them from the list.
    ///
    /// # Safety
    /// The device must own all collected fences.
    pub unsafe fn wait_on_fences(&mut self, device: &ash::Device) -> Result<()> {
        for fence in self.wait_fences.drain(..) {
            wait_for_fence(device, fence, u64::MAX)?;
        }
        Ok(())
    }

    /// Block until the signal fence fires, then reset it. No-op for
    /// bundles without a fence.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_and_reset_fence(&self, device: &ash::Device) -> Result<()> {
        if let Some(fence) = self.signal_fence {
            wait_for_fence(device, fence, u64::MAX)?;
            reset_fence(device, fence)?;
        }
        Ok(())
    }

    /// Reset the signal fence without waiting. No-op without a fence.
    ///
    /// # Safety
    /// The device must be valid and the fence must not be in use.
    pub unsafe fn reset_signal_fence(&self, device: &ash::Device) -> Result<()> {
        if let Some(fence) = self.signal_fence {
            reset_fence(device, fence)?;
        }
        Ok(())
    }

    /// Destroy owned primitives. Collected wait handles are borrowed and
    /// left alone.
    ///
    /// # Safety
    /// Nothing may still be waiting on or signaling these primitives.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for semaphore in self.signal_semaphores.drain(..) {
            device.destroy_semaphore(semaphore, None);
        }
        if let Some(fence) = self.signal_fence.take() {
            device.destroy_fence(fence, None);
        }
        self.clear_waits();
    }

    #[cfg(test)]
    pub(crate) fn stub(signal_count: usize, with_fence: bool) -> Self {
        Self {
            signal_semaphores: vec![vk::Semaphore::null(); signal_count],
            signal_fence: with_fence.then(vk::Fence::null),
            wait_semaphores: Vec::new(),
            wait_fences: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_on_collects_signals_and_fence() {
        let upstream = Synchronization::stub(2, true);
        let mut bundle = Synchronization::stub(1, false);

        bundle.wait_on(&upstream);
        assert_eq!(bundle.wait_semaphores().len(), 2);
        assert_eq!(bundle.wait_fences().len(), 1);

        bundle.clear_waits();
        assert!(bundle.wait_semaphores().is_empty());
        assert!(bundle.wait_fences().is_empty());
    }

    #[test]
    fn wait_on_signals_keeps_the_signal_list() {
        let mut bundle = Synchronization::stub(1, false);
        bundle.wait_on_signals();

        assert_eq!(bundle.wait_semaphores().len(), 1);
        assert_eq!(bundle.signal_semaphores().len(), 1);

        // Repeated acquisition cycles append; present clears between them
        bundle.wait_on_signals();
        assert_eq!(bundle.wait_semaphores().len(), 2);
    }

    #[test]
    fn first_signal_on_empty_bundle_is_none() {
        let bundle = Synchronization::stub(0, false);
        assert!(bundle.first_signal().is_none());
        assert!(bundle.signal_fence().is_none());
    }
}
