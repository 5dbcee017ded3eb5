// Shader module loading
//
// Vulkan consumes SPIR-V. build.rs compiles the GLSL under shaders/ with
// glslc; the .spv files are read at startup from the configured directory.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::handle::Owned;
use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &Arc<VulkanDevice>, code: &[u8]) -> Result<Owned<vk::ShaderModule>> {
    // read_spv copies into u32 words, so the byte slice needs no alignment
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V bytecode")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")?;

    Ok(Owned::new(device.clone(), module))
}

/// Load `<dir>/<name>.spv` and create a shader module from it
pub fn load_shader_module(device: &Arc<VulkanDevice>, dir: &Path, name: &str) -> Result<Owned<vk::ShaderModule>> {
    let path = dir.join(format!("{}.spv", name));
    let code = std::fs::read(&path)
        .with_context(|| format!("Failed to read shader {:?}. Was it compiled with glslc?", path))?;

    log::debug!("Loaded shader {:?} ({} bytes)", path, code.len());
    create_shader_module(device, &code).with_context(|| format!("Shader {:?}", path))
}
