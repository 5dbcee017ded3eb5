// GPU side of the frame loop
//
// Owns every Vulkan object the backend creates and implements FrameDriver on
// top of them. Fields are declared in reverse creation order; Rust drops
// them top to bottom, which tears everything down in the order Vulkan needs.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::buffer::DepthImage;
use super::command::CommandPool;
use super::constants::MAX_FRAMES_IN_FLIGHT;
use super::context::{ApiContext, ContextOptions};
use super::descriptor::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
use super::device::{PresentOutcome, VulkanDevice};
use super::diagnostics::{Diagnostics, ValidationPolicy};
use super::frame::{CameraUniforms, DrawPushConstants, FrameSlot, LightingUniforms};
use super::frame_loop::FrameDriver;
use super::handle::Owned;
use super::pipeline::{
    create_framebuffers, create_render_pass, GraphicsPipelineBuilder, PipelineCache, PipelineLayoutBuilder,
};
use super::shader::load_shader_module;
use super::surface::Surface;
use super::swapchain::{choose_extent, AcquireOutcome, Swapchain};
use crate::scene::Scene;

/// Vertices per procedural cube: 6 faces, 2 triangles each
const CUBE_VERTEX_COUNT: u32 = 36;

/// Everything needed to bring the backend up
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub validation_policy: ValidationPolicy,
    pub present_mode: vk::PresentModeKHR,
    pub shader_dir: PathBuf,
    pub pipeline_cache_path: Option<PathBuf>,
}

pub struct Renderer {
    slots: Vec<FrameSlot>,
    command_pool: CommandPool,
    framebuffers: Vec<Owned<vk::Framebuffer>>,
    depth: DepthImage,
    pipeline: Owned<vk::Pipeline>,
    pipeline_layout: Owned<vk::PipelineLayout>,
    set_layout: DescriptorSetLayout,
    pipeline_cache: PipelineCache,
    render_pass: Owned<vk::RenderPass>,
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
    surface: Surface,
    context: Arc<ApiContext>,
}

impl Renderer {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        extent: vk::Extent2D,
        options: &BackendOptions,
    ) -> Result<Self> {
        log::info!("Initializing Vulkan renderer...");

        let context = ApiContext::new(
            display_handle,
            &ContextOptions {
                app_name: options.app_name.clone(),
                enable_validation: options.enable_validation,
                validation_policy: options.validation_policy,
            },
        )?;
        let surface = Surface::new(context.clone(), display_handle, window_handle)?;
        let device = VulkanDevice::new(context.clone(), &surface)?;
        let swapchain = Swapchain::new(device.clone(), &surface, extent, options.present_mode)?;
        let render_pass = create_render_pass(&device, swapchain.format())?;

        let pipeline_cache = match &options.pipeline_cache_path {
            Some(path) => PipelineCache::load_or_new(&device, path)?,
            None => PipelineCache::new(&device)?,
        };

        let set_layout = DescriptorSetLayoutBuilder::new()
            .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .binding(1, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)?;

        let pipeline_layout = PipelineLayoutBuilder::new()
            .set_layout(set_layout.handle())
            .push_constant::<DrawPushConstants>(
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
            )
            .build(&device)?;

        let pipeline = {
            // Modules are only needed while the pipeline compiles
            let vertex = load_shader_module(&device, &options.shader_dir, "shading.vert")?;
            let fragment = load_shader_module(&device, &options.shader_dir, "shading.frag")?;
            GraphicsPipelineBuilder::new()
                .stage(vk::ShaderStageFlags::VERTEX, vertex.handle())
                .stage(vk::ShaderStageFlags::FRAGMENT, fragment.handle())
                .build(&device, &pipeline_cache, pipeline_layout.handle(), render_pass.handle())
                .context("Failed to build shading pipeline")?
        };

        let depth = DepthImage::new(&device, swapchain.extent())?;
        let framebuffers = create_framebuffers(
            &device,
            swapchain.image_views(),
            depth.view(),
            render_pass.handle(),
            swapchain.extent(),
        )?;

        let command_pool = CommandPool::new(&device)?;
        let command_buffers = command_pool.allocate(MAX_FRAMES_IN_FLIGHT as u32)?;
        let slots = command_buffers
            .into_iter()
            .enumerate()
            .map(|(index, command_buffer)| FrameSlot::new(&device, index, command_buffer))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Renderer ready: {} swapchain images, {} frames in flight",
            swapchain.image_count(),
            slots.len()
        );

        Ok(Self {
            slots,
            command_pool,
            framebuffers,
            depth,
            pipeline,
            pipeline_layout,
            set_layout,
            pipeline_cache,
            render_pass,
            swapchain,
            device,
            surface,
            context,
        })
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        self.context.diagnostics()
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn framebuffer_handle(&self, image_index: u32) -> Option<u64> {
        self.framebuffers
            .get(image_index as usize)
            .map(|framebuffer| framebuffer.handle().as_raw())
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    pub fn save_pipeline_cache(&self, path: &Path) -> Result<()> {
        self.pipeline_cache.save(path)
    }

    fn write_frame_descriptors(&mut self, slot: usize, scene: &Scene) -> Result<vk::DescriptorSet> {
        let extent = self.swapchain.extent();
        let frame = &mut self.slots[slot];

        frame.descriptor_pool.reset()?;
        frame.camera_ubo.write(&CameraUniforms::from_scene(scene, extent))?;
        frame.lighting_ubo.write(&LightingUniforms::from_scene(scene))?;

        let set = frame.descriptor_pool.allocate(&self.set_layout)?;

        let camera_info = [frame.camera_ubo.descriptor_info()];
        let lighting_info = [frame.lighting_ubo.descriptor_info()];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&camera_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&lighting_info)
                .build(),
        ];
        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };

        Ok(set)
    }
}

impl FrameDriver for Renderer {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.slots[slot].in_flight.wait()
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.slots[slot].in_flight.reset()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.swapchain
            .acquire_next_image(self.slots[slot].image_available.handle())
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<vk::Extent2D> {
        // A minimized window can report a zero extent before its resize event lands
        let caps = self.surface.capabilities(self.device.physical_device)?;
        let target = choose_extent(&caps, extent);
        if target.width == 0 || target.height == 0 {
            return Ok(target);
        }

        self.device.wait_idle()?;

        // Framebuffers reference the old views and depth image
        self.framebuffers.clear();
        self.swapchain.recreate(&self.surface, extent)?;

        let extent = self.swapchain.extent();
        self.depth = DepthImage::new(&self.device, extent)?;
        self.framebuffers = create_framebuffers(
            &self.device,
            self.swapchain.image_views(),
            self.depth.view(),
            self.render_pass.handle(),
            extent,
        )?;

        Ok(extent)
    }

    fn record_frame(&mut self, slot: usize, image_index: u32, scene: &Scene) -> Result<()> {
        let descriptor_set = self.write_frame_descriptors(slot, scene)?;

        let cmd = self.slots[slot].command_buffer;
        let extent = self.swapchain.extent();
        let framebuffer = self
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for swapchain image {}", image_index))?
            .handle();

        self.command_pool.begin(cmd)?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: scene.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.handle())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let device = &self.device.device;
        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout.handle(),
                0,
                &[descriptor_set],
                &[],
            );

            for item in &scene.items {
                let constants = DrawPushConstants::from(item);
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout.handle(),
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&constants),
                );
                device.cmd_draw(cmd, CUBE_VERTEX_COUNT, 1, 0, 0);
            }

            device.cmd_end_render_pass(cmd);
        }

        self.command_pool.end(cmd)
    }

    fn submit_frame(&mut self, slot: usize) -> Result<()> {
        let frame = &self.slots[slot];
        self.device.submit(
            frame.command_buffer,
            frame.image_available.handle(),
            frame.render_finished.handle(),
            frame.in_flight.handle(),
        )
    }

    fn present_frame(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.device
            .present(&self.swapchain, image_index, self.slots[slot].render_finished.handle())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");
        // Slot semaphores and buffers may still be in use by the GPU
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle during shutdown failed: {:#}", e);
        }
    }
}
