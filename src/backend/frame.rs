// Frame slots
//
// One slot per frame in flight. A slot exclusively owns everything a frame
// touches between being recorded and its fence signaling, so two frames that
// may be executing at the same time never share a resource.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::sync::Arc;

use super::buffer::Buffer;
use super::constants::{DESCRIPTOR_POOL_SIZES, MAX_DESCRIPTOR_SETS};
use super::descriptor::DescriptorPool;
use super::sync::{Fence, Semaphore};
use super::VulkanDevice;
use crate::scene::{DrawItem, Scene};

/// Camera matrices, set 0 binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniforms {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub camera_position: Vec4,
}

impl CameraUniforms {
    pub fn from_scene(scene: &Scene, extent: vk::Extent2D) -> Self {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let view = scene.camera.view_matrix();
        let projection = scene.camera.projection_matrix(aspect);
        Self {
            view,
            projection,
            view_projection: projection * view,
            camera_position: scene.camera.position.extend(1.0),
        }
    }
}

/// Lighting parameters, set 0 binding 1
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightingUniforms {
    /// xyz: direction the light travels, w: unused
    pub light_direction: Vec4,
    /// x: ambient factor
    pub params: Vec4,
}

impl LightingUniforms {
    pub fn from_scene(scene: &Scene) -> Self {
        Self {
            light_direction: scene.light_direction.normalize_or_zero().extend(0.0),
            params: Vec4::new(scene.ambient, 0.0, 0.0, 0.0),
        }
    }
}

/// Per-draw data pushed right before each draw call
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawPushConstants {
    pub model: Mat4,
    pub color: Vec4,
}

impl From<&DrawItem> for DrawPushConstants {
    fn from(item: &DrawItem) -> Self {
        Self {
            model: item.transform,
            color: item.color,
        }
    }
}

/// Everything one frame in flight owns
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
    pub camera_ubo: Buffer,
    pub lighting_ubo: Buffer,
    pub descriptor_pool: DescriptorPool,
}

impl FrameSlot {
    /// `command_buffer` comes from the shared command pool
    pub fn new(device: &Arc<VulkanDevice>, index: usize, command_buffer: vk::CommandBuffer) -> Result<Self> {
        Ok(Self {
            command_buffer,
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            // Signaled, so the slot's first wait returns immediately
            in_flight: Fence::new(device, true)?,
            camera_ubo: Buffer::uniform::<CameraUniforms>(device, &format!("camera_ubo[{}]", index))?,
            lighting_ubo: Buffer::uniform::<LightingUniforms>(device, &format!("lighting_ubo[{}]", index))?,
            descriptor_pool: DescriptorPool::new(device, MAX_DESCRIPTOR_SETS, DESCRIPTOR_POOL_SIZES)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_uniform_layouts_match_std140() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 3 * 64 + 16);
        assert_eq!(std::mem::size_of::<LightingUniforms>(), 32);
        // Must stay within the 128 bytes every implementation guarantees
        assert!(std::mem::size_of::<DrawPushConstants>() <= 128);
    }

    #[test]
    fn test_camera_uniforms_follow_extent_aspect() {
        let scene = Scene::default();
        let wide = CameraUniforms::from_scene(&scene, vk::Extent2D { width: 1600, height: 800 });
        let square = CameraUniforms::from_scene(&scene, vk::Extent2D { width: 800, height: 800 });
        assert!((square.projection.x_axis.x / wide.projection.x_axis.x - 2.0).abs() < 1e-4);
        assert_eq!(wide.view_projection, wide.projection * wide.view);
    }

    #[test]
    fn test_zero_extent_does_not_divide_by_zero() {
        let uniforms = CameraUniforms::from_scene(&Scene::default(), vk::Extent2D { width: 0, height: 0 });
        assert!(uniforms.projection.is_finite());
    }

    #[test]
    fn test_lighting_direction_is_normalized() {
        let scene = Scene {
            light_direction: Vec3::new(0.0, -10.0, 0.0),
            ambient: 0.25,
            ..Scene::default()
        };
        let lighting = LightingUniforms::from_scene(&scene);
        assert_eq!(lighting.light_direction, Vec4::new(0.0, -1.0, 0.0, 0.0));
        assert_eq!(lighting.params.x, 0.25);
    }
}
