// Synchronization primitives
//
// Fences answer "may the CPU touch this frame's resources again".
// Semaphores order GPU work against GPU work and have no host-side operations.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::device_error;
use super::handle::Owned;
use super::VulkanDevice;
use crate::error::BackendError;

/// Effectively forever; a real timeout only happens on device loss
const FENCE_TIMEOUT_NS: u64 = u64::MAX;

pub struct Fence(Owned<vk::Fence>);

impl Fence {
    /// Create a fence; `signaled` fences satisfy their first wait immediately
    pub fn new(device: &Arc<VulkanDevice>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe { device.device.create_fence(&create_info, None) }
            .context("Failed to create fence")?;

        Ok(Self(Owned::new(device.clone(), fence)))
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.0.handle()
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.0.owner().device.reset_fences(&[self.handle()]) }
            .map_err(device_error)
            .context("Failed to reset fence")
    }

    /// Block the calling thread until the fence is signaled
    pub fn wait(&self) -> Result<()> {
        let result = unsafe {
            self.0
                .owner()
                .device
                .wait_for_fences(&[self.handle()], true, FENCE_TIMEOUT_NS)
        };

        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                Err(BackendError::DeviceLost("fence wait timed out".to_string()).into())
            }
            Err(e) => Err(device_error(e)).context("Failed to wait for fence"),
        }
    }
}

pub struct Semaphore(Owned<vk::Semaphore>);

impl Semaphore {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }
            .context("Failed to create semaphore")?;

        Ok(Self(Owned::new(device.clone(), semaphore)))
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.0.handle()
    }
}
