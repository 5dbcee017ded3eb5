// =============================================================================
// FRAME BACKEND DEMO - winit shell around the Vulkan backend
// =============================================================================
//
// The shell owns the window and a small demo scene. Everything GPU-related
// lives behind the RenderBackend trait.
//
// FRAME FLOW (one redraw):
// 1. Animate the demo scene
// 2. begin_frame  - wait for the slot, acquire a swapchain image
// 3. render_scene - record and submit
// 4. end_frame    - present
//
// =============================================================================

use anyhow::{Context, Result};
use frame_backend::config::Config;
use frame_backend::{
    BackendEvent, BackendOptions, Camera, DrawItem, FrameStatus, PlatformEvent, RenderBackend, Scene,
    VulkanBackend,
};
use glam::{Mat4, Quat, Vec3, Vec4};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame backend demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// env_logger with the configured level as default; RUST_LOG still wins
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str()));

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// DEMO SCENE
// =============================================================================

const GRID: i32 = 3;
const SPACING: f32 = 2.5;

fn demo_scene() -> Scene {
    Scene {
        camera: Camera {
            position: Vec3::new(0.0, 4.0, 9.0),
            fov: 60.0,
            ..Camera::default()
        },
        ..Scene::default()
    }
}

/// A GRID x GRID field of cubes, each spinning at its own rate
fn demo_items(seconds: f32) -> Vec<DrawItem> {
    let half = (GRID - 1) as f32 * 0.5;
    (0..GRID)
        .flat_map(|x| (0..GRID).map(move |z| (x, z)))
        .map(|(x, z)| {
            let position = Vec3::new((x as f32 - half) * SPACING, 0.0, (z as f32 - half) * SPACING);
            let speed = 0.5 + 0.25 * (x + z) as f32;
            let rotation = Quat::from_rotation_y(seconds * speed) * Quat::from_rotation_x(seconds * speed * 0.5);
            DrawItem {
                transform: Mat4::from_rotation_translation(rotation, position),
                color: Vec4::new(
                    0.3 + 0.35 * x as f32 / half.max(1.0),
                    0.6,
                    0.3 + 0.35 * z as f32 / half.max(1.0),
                    1.0,
                ),
            }
        })
        .collect()
}

/// A window with no area is reported as minimized
fn size_event(width: u32, height: u32) -> PlatformEvent {
    if width == 0 || height == 0 {
        PlatformEvent::Minimized
    } else {
        PlatformEvent::Resized { width, height }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the backend goes before the window it draws into
struct App {
    config: Config,
    backend: Option<VulkanBackend>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    scene: Scene,
    backend_events: Vec<BackendEvent>,
    start_time: Instant,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,

    /// First unrecoverable error; returned from main
    fatal: Option<anyhow::Error>,
    exiting: bool,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            backend: None,
            window: None,
            is_fullscreen,
            scene: demo_scene(),
            backend_events: Vec::new(),
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
            fatal: None,
            exiting: false,
        }
    }

    fn init_backend(&mut self, window: &Window) -> Result<VulkanBackend> {
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let options = BackendOptions {
            app_name: self.config.window.title.clone(),
            enable_validation: self.config.debug.validation_layers,
            validation_policy: self.config.debug.validation_policy,
            present_mode: self.config.present_mode(),
            shader_dir: self.config.graphics.shader_dir.clone(),
            pipeline_cache_path: self.config.graphics.pipeline_cache_path.clone(),
        };

        let size = window.inner_size();
        let mut backend = VulkanBackend::new(
            display_handle,
            window_handle,
            (size.width, size.height),
            self.config.graphics.clear_color,
            &options,
        )?;
        backend.on_init(&mut self.scene)?;
        Ok(backend)
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns true if a frame was presented
    fn render_frame(&mut self) -> Result<bool> {
        if self.exiting {
            return Ok(false);
        }
        let (Some(backend), Some(window)) = (self.backend.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        // Size checked before acquiring, so a resize never reaches render_scene late
        let size = window.inner_size();
        backend.on_event(&size_event(size.width, size.height));

        if backend.begin_frame()? == FrameStatus::NotReady {
            return Ok(false);
        }

        self.scene.items = demo_items(self.start_time.elapsed().as_secs_f32());

        backend.render_scene(&self.scene, (size.width, size.height), &mut self.backend_events)?;
        backend.end_frame()?;

        for event in self.backend_events.drain(..) {
            match event {
                BackendEvent::SwapchainRecreated { width, height } => {
                    log::debug!("Now rendering at {}x{}", width, height);
                }
            }
        }

        Ok(true)
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        self.exiting = true;

        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.on_quit() {
                log::error!("Shutdown error: {:#}", e);
            }
        }
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.stop();
        }
        self.shutdown(event_loop);
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resulting Resized event triggers swapchain recreation
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_backend(&window) {
            Ok(backend) => self.backend = Some(backend),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(backend) = self.backend.as_mut() {
                    backend.on_event(&PlatformEvent::CloseRequested);
                }
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(backend) = self.backend.as_mut() {
                    backend.on_event(&size_event(size.width, size.height));
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                if let Some(backend) = self.backend.as_mut() {
                                    backend.stop();
                                }
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }

        if self.backend.as_ref().is_some_and(|backend| backend.should_quit()) {
            self.shutdown(event_loop);
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
