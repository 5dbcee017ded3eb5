// Render pass, pipeline cache and pipeline builders
//
// The pipeline cache lives as long as the backend and is fed into every
// pipeline compilation. It is purely a performance cache: its blob may be
// saved to disk and handed back on the next run, and a blob that does not
// match this GPU is simply ignored.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::constants::DEPTH_FORMAT;
use super::handle::Owned;
use super::VulkanDevice;

/// Create a render pass for basic color attachment rendering with depth
pub fn create_render_pass(device: &Arc<VulkanDevice>, format: vk::Format) -> Result<Owned<vk::RenderPass>> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // Wait for the acquire semaphore's stage before writing color/depth.
    // The depth image is shared between frames, so also order against the
    // previous frame's depth writes.
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = &[color_attachment, depth_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")?;

    Ok(Owned::new(device.clone(), render_pass))
}

/// Create framebuffers for each swapchain image (with depth attachment)
pub fn create_framebuffers(
    device: &Arc<VulkanDevice>,
    image_views: impl Iterator<Item = vk::ImageView>,
    depth_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<Owned<vk::Framebuffer>>> {
    image_views
        .map(|image_view| {
            let attachments = &[image_view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")?;
            Ok(Owned::new(device.clone(), framebuffer))
        })
        .collect()
}

/// Size of the fixed header at the start of every pipeline cache blob
const CACHE_HEADER_LEN: usize = 16 + vk::UUID_SIZE;

/// True if `blob` carries a version-one header written by this exact GPU
pub fn cache_blob_matches(blob: &[u8], properties: &vk::PhysicalDeviceProperties) -> bool {
    if blob.len() < CACHE_HEADER_LEN {
        return false;
    }

    let word = |index: usize| {
        let start = index * 4;
        u32::from_le_bytes([blob[start], blob[start + 1], blob[start + 2], blob[start + 3]])
    };

    let header_len = word(0) as usize;
    let version = word(1);
    let vendor_id = word(2);
    let device_id = word(3);
    let uuid = &blob[16..CACHE_HEADER_LEN];

    header_len >= CACHE_HEADER_LEN
        && version == vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32
        && vendor_id == properties.vendor_id
        && device_id == properties.device_id
        && uuid == &properties.pipeline_cache_uuid[..]
}

pub struct PipelineCache {
    cache: Owned<vk::PipelineCache>,
}

impl PipelineCache {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        Self::with_initial_data(device, &[])
    }

    /// Seed the cache from a blob saved on a previous run, if there is one
    pub fn load_or_new(device: &Arc<VulkanDevice>, path: &Path) -> Result<Self> {
        let blob = match std::fs::read(path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No pipeline cache at {:?}, starting empty", path);
                return Self::new(device);
            }
            Err(e) => {
                log::warn!("Failed to read pipeline cache {:?}: {}", path, e);
                return Self::new(device);
            }
        };

        if !cache_blob_matches(&blob, &device.properties) {
            log::warn!("Pipeline cache {:?} was written by another GPU or driver, ignoring it", path);
            return Self::new(device);
        }

        match Self::with_initial_data(device, &blob) {
            Ok(cache) => {
                log::info!("Loaded pipeline cache {:?} ({} bytes)", path, blob.len());
                Ok(cache)
            }
            Err(e) => {
                log::warn!("Driver rejected pipeline cache {:?}: {:#}", path, e);
                Self::new(device)
            }
        }
    }

    fn with_initial_data(device: &Arc<VulkanDevice>, blob: &[u8]) -> Result<Self> {
        let create_info = vk::PipelineCacheCreateInfo::builder().initial_data(blob);

        let cache = unsafe { device.device.create_pipeline_cache(&create_info, None) }
            .context("Failed to create pipeline cache")?;

        Ok(Self {
            cache: Owned::new(device.clone(), cache),
        })
    }

    /// Current contents as an opaque blob
    pub fn data(&self) -> Result<Vec<u8>> {
        unsafe { self.cache.owner().device.get_pipeline_cache_data(self.cache.handle()) }
            .context("Failed to read pipeline cache data")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let blob = self.data()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        std::fs::write(path, &blob).with_context(|| format!("Failed to write pipeline cache {:?}", path))?;
        log::info!("Saved pipeline cache {:?} ({} bytes)", path, blob.len());
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineCache {
        self.cache.handle()
    }
}

#[derive(Default)]
pub struct PipelineLayoutBuilder {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constants: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }

    pub fn push_constant<T>(mut self, stages: vk::ShaderStageFlags, offset: u32) -> Self {
        self.push_constants.push(
            vk::PushConstantRange::builder()
                .stage_flags(stages)
                .offset(offset)
                .size(std::mem::size_of::<T>() as u32)
                .build(),
        );
        self
    }

    pub fn build(self, device: &Arc<VulkanDevice>) -> Result<Owned<vk::PipelineLayout>> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constants);

        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        Ok(Owned::new(device.clone(), layout))
    }
}

/// Depth-tested, back-face-culled triangle list with dynamic viewport/scissor,
/// so it survives resizes
#[derive(Default)]
pub struct GraphicsPipelineBuilder {
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
}

impl GraphicsPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        self.stages.push((stage, module));
        self
    }

    pub fn build(
        self,
        device: &Arc<VulkanDevice>,
        cache: &PipelineCache,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<Owned<vk::Pipeline>> {
        anyhow::ensure!(!self.stages.is_empty(), "Pipeline has no shader stages");

        let entry_point: &CStr = c"main";
        let shader_stages: Vec<_> = self
            .stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(entry_point)
                    .build()
            })
            .collect();

        // Geometry is generated in the vertex shader; no vertex buffers
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            // Projection flips Y, so outward CCW faces stay CCW on screen
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(cache.handle(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

        let pipeline = pipelines.into_iter().next().context("Driver returned no pipeline")?;
        Ok(Owned::new(device.clone(), pipeline))
    }
}
