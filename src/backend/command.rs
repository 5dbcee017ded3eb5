// Command pool shared by every frame slot
//
// Each slot gets one primary buffer from here at startup. Buffers are reset
// at the start of their slot's frame and freed only with the pool.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::handle::Owned;
use super::VulkanDevice;

pub struct CommandPool {
    pool: Owned<vk::CommandPool>,
}

impl CommandPool {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool: Owned::new(device.clone(), pool),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.pool.owner().device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Clear a buffer for re-recording; its slot fence must have been waited on
    pub fn reset(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.pool
                .owner()
                .device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")
    }

    /// Reset then begin a one-time-submit recording
    pub fn begin(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.reset(command_buffer)?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.pool
                .owner()
                .device
                .begin_command_buffer(command_buffer, &begin_info)
        }
        .context("Failed to begin command buffer")
    }

    pub fn end(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.pool.owner().device.end_command_buffer(command_buffer) }
            .context("Failed to end command buffer")
    }
}
