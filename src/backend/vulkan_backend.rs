// Vulkan implementation of RenderBackend

use anyhow::Result;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::PathBuf;

use super::frame_loop::{FrameLoop, FrameStatus};
use super::renderer::{BackendOptions, Renderer};
use crate::render_backend::{BackendEvent, Dispatcher, PlatformEvent, RenderBackend};
use crate::scene::Scene;

pub struct VulkanBackend {
    // Frame state first; the renderer owns the GPU objects and goes last
    frame_loop: FrameLoop,
    renderer: Renderer,
    announced_generation: u64,
    clear_color: [f32; 4],
    pipeline_cache_path: Option<PathBuf>,
    quit_requested: bool,
}

impl VulkanBackend {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        framebuffer_size: (u32, u32),
        clear_color: [f32; 4],
        options: &BackendOptions,
    ) -> Result<Self> {
        let renderer = Renderer::new(display_handle, window_handle, extent_of(framebuffer_size), options)?;
        let frame_loop = FrameLoop::new(renderer.diagnostics().clone(), renderer.swapchain_extent());

        Ok(Self {
            frame_loop,
            renderer,
            announced_generation: 0,
            clear_color,
            pipeline_cache_path: options.pipeline_cache_path.clone(),
            quit_requested: false,
        })
    }
}

fn extent_of((width, height): (u32, u32)) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

impl RenderBackend for VulkanBackend {
    fn on_init(&mut self, scene: &mut Scene) -> Result<()> {
        scene.clear_color = self.clear_color;
        Ok(())
    }

    fn on_event(&mut self, event: &PlatformEvent) {
        match *event {
            PlatformEvent::Resized { width, height } => {
                self.frame_loop.set_surface_extent(extent_of((width, height)));
            }
            PlatformEvent::Minimized => self.frame_loop.set_surface_extent(extent_of((0, 0))),
            PlatformEvent::CloseRequested => self.stop(),
        }
    }

    fn begin_frame(&mut self) -> Result<FrameStatus> {
        self.frame_loop.begin_frame(&mut self.renderer)
    }

    fn render_scene(
        &mut self,
        scene: &Scene,
        framebuffer_size: (u32, u32),
        dispatcher: &mut dyn Dispatcher,
    ) -> Result<()> {
        self.frame_loop
            .render_scene(&mut self.renderer, scene, extent_of(framebuffer_size))?;

        let generation = self.frame_loop.generation();
        if generation != self.announced_generation {
            self.announced_generation = generation;
            let extent = self.frame_loop.swapchain_extent();
            dispatcher.dispatch(BackendEvent::SwapchainRecreated {
                width: extent.width,
                height: extent.height,
            });
        }
        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        self.frame_loop.end_frame(&mut self.renderer)
    }

    fn should_quit(&self) -> bool {
        self.quit_requested
    }

    fn stop(&mut self) {
        self.quit_requested = true;
    }

    fn on_quit(&mut self) -> Result<()> {
        self.renderer.wait_idle()?;
        if let Some(path) = &self.pipeline_cache_path {
            self.renderer.save_pipeline_cache(path)?;
        }
        Ok(())
    }

    fn primary_framebuffer_handle(&self) -> Option<u64> {
        self.frame_loop
            .current_image()
            .and_then(|image_index| self.renderer.framebuffer_handle(image_index))
    }
}
