// Fixed backend policy. None of this is runtime tunable.

use ash::vk;
use std::ffi::CStr;

/// Frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// API version requested at instance creation
pub const API_VERSION: u32 = vk::API_VERSION_1_2;

/// Layers enabled when validation is on
pub const VALIDATION_LAYERS: &[&CStr] = &[c"VK_LAYER_KHRONOS_validation"];

/// Extensions every candidate adapter must expose
pub const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[
    c"VK_KHR_swapchain",
    c"VK_KHR_push_descriptor",
    c"VK_EXT_descriptor_indexing",
];

/// Must be enabled whenever an adapter advertises it (MoltenVK and friends)
pub const PORTABILITY_SUBSET_EXTENSION: &CStr = c"VK_KHR_portability_subset";

/// Upper bound on descriptor sets allocated from one frame slot's pool
pub const MAX_DESCRIPTOR_SETS: u32 = 2_048;

/// Per-type descriptor counts of each frame slot's pool
pub const DESCRIPTOR_POOL_SIZES: &[vk::DescriptorPoolSize] = &[
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        descriptor_count: 2_048,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 2_048,
    },
];

/// How many times begin_frame recreates and re-acquires on an out-of-date surface
pub const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Depth attachment format shared by the render pass and the depth image
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
