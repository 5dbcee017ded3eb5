// What the application sees of a renderer
//
// The shell forwards window events and drives one begin / render / end cycle
// per redraw. VulkanBackend is the only implementation.

use anyhow::Result;

pub use crate::backend::frame_loop::FrameStatus;
use crate::scene::Scene;

/// Window-system events the backend cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    /// New framebuffer size in physical pixels
    Resized { width: u32, height: u32 },
    Minimized,
    CloseRequested,
}

/// Notifications from the backend to the rest of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    SwapchainRecreated { width: u32, height: u32 },
}

pub trait Dispatcher {
    fn dispatch(&mut self, event: BackendEvent);
}

impl Dispatcher for Vec<BackendEvent> {
    fn dispatch(&mut self, event: BackendEvent) {
        self.push(event);
    }
}

pub trait RenderBackend {
    /// Called once before the first frame; may adjust the scene to the backend's settings
    fn on_init(&mut self, scene: &mut Scene) -> Result<()>;

    fn on_event(&mut self, event: &PlatformEvent);

    /// Wait for the next frame slot and acquire an image
    fn begin_frame(&mut self) -> Result<FrameStatus>;

    /// Record and submit the scene; only valid after `begin_frame` returned Ready
    fn render_scene(
        &mut self,
        scene: &Scene,
        framebuffer_size: (u32, u32),
        dispatcher: &mut dyn Dispatcher,
    ) -> Result<()>;

    /// Present what `render_scene` submitted
    fn end_frame(&mut self) -> Result<()>;

    fn should_quit(&self) -> bool;

    fn stop(&mut self);

    /// Wait for the GPU and persist anything worth keeping
    fn on_quit(&mut self) -> Result<()>;

    /// Raw handle of the framebuffer the current frame renders into
    fn primary_framebuffer_handle(&self) -> Option<u64>;
}
