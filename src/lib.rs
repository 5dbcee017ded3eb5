//! Vulkan rendering backend: device bootstrap, swapchain lifecycle and a
//! fixed number of frames in flight behind the `RenderBackend` trait.

pub mod backend;
pub mod config;
pub mod error;
pub mod render_backend;
pub mod scene;

pub use backend::{BackendOptions, VulkanBackend};
pub use error::BackendError;
pub use render_backend::{BackendEvent, Dispatcher, FrameStatus, PlatformEvent, RenderBackend};
pub use scene::{Camera, DrawItem, Scene};
