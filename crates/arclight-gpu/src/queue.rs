//! Device queues with serialized submission.

use crate::error::Result;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Role a queue is retrieved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
}

/// A device queue plus the lock serializing submission to it.
///
/// Queues retrieved for different roles can alias the same underlying
/// `vk::Queue` when the device exposes few families; aliased queues share
/// one lock, so concurrent chains never race on `vkQueueSubmit`.
#[derive(Clone)]
pub struct Queue {
    handle: vk::Queue,
    family: u32,
    lock: Arc<Mutex<()>>,
}

impl Queue {
    pub(crate) fn new(handle: vk::Queue, family: u32, lock: Arc<Mutex<()>>) -> Self {
        Self {
            handle,
            family,
            lock,
        }
    }

    /// Queue family index this queue was created from.
    #[must_use]
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Raw queue handle.
    #[must_use]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Submit command buffers, holding the queue lock for the duration.
    ///
    /// # Safety
    /// The device must be valid and all handles must belong to it.
    pub unsafe fn submit(
        &self,
        device: &ash::Device,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(command_buffers)
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .signal_semaphores(signal_semaphores);

        let _guard = self.lock.lock();
        device.queue_submit(self.handle, &[submit_info], fence)?;
        Ok(())
    }

    /// Submit command buffers and block until they complete.
    ///
    /// # Safety
    /// Same contract as [`submit`](Self::submit).
    pub unsafe fn submit_and_wait(
        &self,
        device: &ash::Device,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);

        let _guard = self.lock.lock();
        device.queue_submit(self.handle, &[submit_info], vk::Fence::null())?;
        device.queue_wait_idle(self.handle)?;
        Ok(())
    }

    /// Present a swapchain image.
    ///
    /// Returns `Ok(true)` when the swapchain is stale and must be recreated.
    ///
    /// # Safety
    /// The loader, swapchain and semaphores must be valid.
    pub unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let _guard = self.lock.lock();
        match loader.queue_present(self.handle, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until all work on this queue has finished.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_idle(&self, device: &ash::Device) -> Result<()> {
        let _guard = self.lock.lock();
        device.queue_wait_idle(self.handle)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliased_queues_share_the_submission_lock() {
        let lock = Arc::new(Mutex::new(()));
        let graphics = Queue::new(vk::Queue::null(), 0, lock.clone());
        let transfer = Queue::new(vk::Queue::null(), 0, lock);

        let guard = graphics.lock.lock();
        assert!(transfer.lock.try_lock().is_none());
        drop(guard);
        assert!(transfer.lock.try_lock().is_some());
    }
}
