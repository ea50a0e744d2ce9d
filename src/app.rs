//! Application setup and the single-threaded frame loop

use std::time::Instant;

use glam::Vec3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use winit::{
    event::{DeviceEvent, Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
};

use crate::backend::traits::*;
use crate::backend::WgpuBackend;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{FrameRenderer, InstanceData, InstancedModel, SceneAssets};
use crate::resources::{FileImageSource, ImageSource, Model, TextureCache};
use crate::scene::{Camera, InputState};
use crate::window::Window;
use crate::AppConfig;

/// Load the planet, the rock and the skybox and generate the asteroid ring.
///
/// Missing models load as empty and missing skybox faces become placeholders;
/// only backend failures are returned. `source` supplies one image source per
/// texture cache.
pub fn load_scene<B, S, F>(backend: &mut B, config: &AppConfig, mut source: F) -> RenderResult<SceneAssets<S>>
where
    B: GraphicsBackend,
    S: ImageSource,
    F: FnMut() -> S,
{
    let planet = Model::load_or_empty(backend, &config.planet_model, source())?;
    let rock = match Model::load_or_empty(backend, &config.rock_model, source()) {
        Ok(rock) => rock,
        Err(e) => {
            planet.destroy(backend);
            return Err(e);
        }
    };

    let mut rng = match config.scene.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let data = InstanceData::generate(&config.scene.ring, &mut rng);
    let asteroids = match InstancedModel::new(backend, rock, data) {
        Ok(asteroids) => asteroids,
        Err(e) => {
            planet.destroy(backend);
            return Err(e);
        }
    };

    let mut sky_textures = TextureCache::new(source());
    match sky_textures.load_cubemap(backend, &config.skybox) {
        Ok(skybox) => Ok(SceneAssets {
            planet,
            asteroids,
            sky_textures,
            skybox,
        }),
        Err(e) => {
            sky_textures.destroy(backend);
            asteroids.destroy(backend);
            planet.destroy(backend);
            Err(e)
        }
    }
}

/// What the loop does after a render attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing was presented; try again next tick
    Skipped,
    /// The surface must be reconfigured before the next frame
    Reconfigure,
}

/// Sort a render result into what the loop should do next. Only errors the
/// loop cannot recover from are returned.
pub fn frame_outcome(result: RenderResult<()>) -> RenderResult<FrameOutcome> {
    match result {
        Ok(()) => Ok(FrameOutcome::Presented),
        Err(RenderError::Backend(BackendError::SurfaceTimeout)) => Ok(FrameOutcome::Skipped),
        Err(RenderError::Backend(BackendError::SurfaceLost)) => Ok(FrameOutcome::Reconfigure),
        Err(e) => Err(e),
    }
}

/// Everything the loop mutates. Input handlers only touch `input`; the camera
/// changes only while a frame drains the queue.
pub struct RenderContext {
    window: Window,
    backend: WgpuBackend,
    renderer: FrameRenderer,
    camera: Camera,
    input: InputState,
    start: Instant,
    last_frame: Instant,
}

impl RenderContext {
    pub fn new(window: Window, config: &AppConfig) -> RenderResult<Self> {
        let mut backend = WgpuBackend::new(window.window_arc(), config.vsync)?;
        let scene = load_scene(&mut backend, config, || FileImageSource)?;
        let renderer = FrameRenderer::new(
            &mut backend,
            scene,
            &config.shader_dir,
            config.sample_count,
            config.scene.frame,
        )?;
        let camera = Camera::new(config.scene.camera_position).look_at(Vec3::ZERO);
        let now = Instant::now();
        Ok(Self {
            window,
            backend,
            renderer,
            camera,
            input: InputState::new(),
            start: now,
            last_frame: now,
        })
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn handle_window_event(&mut self, event: &WindowEvent) {
        self.window.handle_event(event, &mut self.input);
    }

    pub fn handle_device_event(&mut self, event: &DeviceEvent) {
        self.window.handle_device_event(event, &mut self.input);
    }

    /// Drain input, follow resizes and draw one frame. Returns `false` once
    /// the application should exit.
    pub fn tick(&mut self) -> RenderResult<bool> {
        if self.window.should_close() {
            return Ok(false);
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        let frame_input = self.input.drain(dt);
        if frame_input.quit {
            return Ok(false);
        }
        for event in frame_input.camera {
            self.camera.apply(event);
        }

        if self.window.take_resized() {
            let (width, height) = self.window.dimensions();
            self.backend.resize(width, height);
            let (width, height) = self.backend.surface_size();
            self.renderer.resize(&mut self.backend, width, height)?;
        }
        if self.window.is_minimized() {
            return Ok(true);
        }

        let elapsed = now.duration_since(self.start).as_secs_f32();
        match frame_outcome(self.renderer.render(&mut self.backend, &self.camera, elapsed))? {
            FrameOutcome::Presented => self.window.frame_presented(now),
            FrameOutcome::Skipped => log::debug!("Surface image not ready, skipping frame"),
            FrameOutcome::Reconfigure => {
                log::warn!("Surface lost, reconfiguring");
                let (width, height) = self.window.dimensions();
                self.backend.resize(width, height);
            }
        }
        Ok(true)
    }

    /// Wait for in-flight GPU work, then release every GPU object once
    pub fn shutdown(mut self) {
        self.backend.wait_idle();
        self.renderer.destroy(&mut self.backend);
        log::info!("Shut down cleanly");
    }
}

/// Open the window and run until it closes or Escape is pressed
pub fn run(config: AppConfig) -> RenderResult<()> {
    let event_loop =
        EventLoop::new().map_err(|e| BackendError::InitializationFailed(format!("event loop: {}", e)))?;
    let window = Window::new(&event_loop, &config.title, config.width, config.height)?;
    let mut context = match RenderContext::new(window, &config) {
        Ok(context) => Some(context),
        Err(e) => {
            log::error!("Initialization failed: {}", e);
            return Err(e);
        }
    };
    let mut failure = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            if let Event::LoopExiting = event {
                if let Some(context) = context.take() {
                    context.shutdown();
                }
                return;
            }
            let Some(ctx) = context.as_mut() else {
                return;
            };

            match event {
                Event::WindowEvent { event, .. } => {
                    ctx.handle_window_event(&event);
                    if let WindowEvent::CloseRequested = event {
                        elwt.exit();
                    }
                }
                Event::DeviceEvent { event, .. } => ctx.handle_device_event(&event),
                Event::AboutToWait => match ctx.tick() {
                    Ok(true) => {}
                    Ok(false) => elwt.exit(),
                    Err(e) => {
                        log::error!("Frame failed: {}", e);
                        failure = Some(e);
                        elwt.exit();
                    }
                },
                _ => {}
            }
        })
        .map_err(|e| BackendError::InitializationFailed(format!("event loop: {}", e)))?;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
