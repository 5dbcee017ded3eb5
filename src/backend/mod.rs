// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Shared state (device, context) is passed
// explicitly as Arc; nothing here is global.

pub mod buffer;
pub mod command;
pub mod constants;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod diagnostics;
pub mod frame;
pub mod frame_loop;
pub mod handle;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan_backend;

pub use constants::MAX_FRAMES_IN_FLIGHT;
pub use context::ApiContext;
pub use device::VulkanDevice;
pub use renderer::BackendOptions;
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use vulkan_backend::VulkanBackend;
