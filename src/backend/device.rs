// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (queue families, extensions, prefer discrete GPU)
// - Logical device + graphics/present queue creation
// - Memory allocator setup
// - Queue submission and presentation

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::constants::{PORTABILITY_SUBSET_EXTENSION, REQUIRED_DEVICE_EXTENSIONS};
use super::{ApiContext, Surface, Swapchain};
use crate::error::BackendError;

/// Queue capabilities of one family, as relevant to selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyCaps {
    pub graphics: bool,
    pub present: bool,
}

/// Everything the selector looks at for one adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<QueueFamilyCaps>,
    pub extensions: Vec<CString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, for queue create infos
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

impl AdapterInfo {
    /// Graphics and present families, preferring one family that does both
    pub fn queue_families(&self) -> Option<QueueFamilies> {
        let combined = self
            .queue_families
            .iter()
            .position(|caps| caps.graphics && caps.present);
        if let Some(index) = combined {
            return Some(QueueFamilies {
                graphics: index as u32,
                present: index as u32,
            });
        }

        let graphics = self.queue_families.iter().position(|caps| caps.graphics)?;
        let present = self.queue_families.iter().position(|caps| caps.present)?;
        Some(QueueFamilies {
            graphics: graphics as u32,
            present: present as u32,
        })
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|ext| ext.as_c_str() == name)
    }

    pub fn missing_extensions(&self) -> Vec<&'static CStr> {
        REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .copied()
            .filter(|name| !self.supports_extension(name))
            .collect()
    }

    /// None if the adapter cannot run the backend at all
    pub fn score(&self) -> Option<u32> {
        self.queue_families()?;
        if !self.missing_extensions().is_empty() {
            return None;
        }

        let score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            _ => 1,
        };
        Some(score)
    }
}

/// Index of the best eligible adapter; ties go to the first one
pub fn select_adapter(adapters: &[AdapterInfo]) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, adapter) in adapters.iter().enumerate() {
        if let Some(score) = adapter.score() {
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((index, score));
            }
        }
    }
    best.map(|(index, _)| index)
}

/// Outcome of a present call that did not fail outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Still presentable, but should be recreated soon
    Suboptimal,
    /// Stale surface, recreate before the next frame
    OutOfDate,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Allocator must go before the device; see Drop
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles (present may alias graphics)
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    /// Entry points of the required push-descriptor extension
    pub push_descriptor: khr::PushDescriptor,

    // Cached for pipeline cache validation and logging
    pub properties: vk::PhysicalDeviceProperties,

    context: Arc<ApiContext>,
}

impl VulkanDevice {
    /// Pick an adapter able to present to `surface` and create the device
    pub fn new(context: Arc<ApiContext>, surface: &Surface) -> Result<Arc<Self>> {
        let instance = &context.instance;

        let (physical_device, adapter) = Self::pick_physical_device(instance, surface)?;
        let queue_families = adapter
            .queue_families()
            .ok_or(BackendError::NoSuitableGpu)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!("Queue families: {:?}", queue_families);

        let device = Self::create_logical_device(instance, physical_device, &adapter, queue_families)?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let allocator = match Self::create_allocator(instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let push_descriptor = khr::PushDescriptor::new(instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            graphics_queue,
            present_queue,
            queue_families,
            push_descriptor,
            properties,
            context,
        }))
    }

    fn describe_adapter(
        instance: &ash::Instance,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Result<AdapterInfo> {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let queue_families = families
            .iter()
            .enumerate()
            .map(|(index, family)| {
                Ok(QueueFamilyCaps {
                    graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                    present: surface.supports_present(physical_device, index as u32)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }?
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
            .collect();

        Ok(AdapterInfo {
            device_type: props.device_type,
            queue_families,
            extensions,
        })
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: &Surface,
    ) -> Result<(vk::PhysicalDevice, AdapterInfo)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut adapters = devices
            .iter()
            .map(|&device| Self::describe_adapter(instance, surface, device))
            .collect::<Result<Vec<_>>>()?;

        for adapter in &adapters {
            let missing = adapter.missing_extensions();
            if !missing.is_empty() {
                log::debug!("{:?} adapter lacks {:?}", adapter.device_type, missing);
            }
        }

        let index = select_adapter(&adapters).ok_or(BackendError::NoSuitableGpu)?;
        Ok((devices[index], adapters.swap_remove(index)))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        adapter: &AdapterInfo,
        queue_families: QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let mut extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
        if adapter.supports_extension(PORTABILITY_SUBSET_EXTENSION) {
            extensions.push(PORTABILITY_SUBSET_EXTENSION.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    /// Queue one frame's commands: wait for the image, signal render-finished and the fence
    pub fn submit(
        &self,
        command_buffer: vk::CommandBuffer,
        image_available: vk::Semaphore,
        render_finished: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], fence)
        }
        .map_err(device_error)
        .context("Failed to submit frame")
    }

    /// Present a swapchain image once render-finished is signaled
    pub fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        render_finished: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [render_finished];
        let swapchains = [swapchain.handle()];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { swapchain.loader().queue_present(self.present_queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(device_error(e)).context("Failed to present swapchain image"),
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(device_error)
            .context("Failed to wait for device idle")
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.context.instance
    }

    pub fn context(&self) -> &Arc<ApiContext> {
        &self.context
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

/// Device loss gets its own error kind; everything else stays a vk::Result
pub(crate) fn device_error(result: vk::Result) -> anyhow::Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost(format!("{:?}", result)).into(),
        other => anyhow::Error::new(other),
    }
}
