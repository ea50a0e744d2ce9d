//! Window management using winit

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use winit::{
    dpi::PhysicalSize,
    event::{DeviceEvent, ElementState, KeyEvent, MouseScrollDelta, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{CursorGrabMode, Window as WinitWindow, WindowBuilder},
};

use crate::backend::BackendError;
use crate::error::RenderResult;
use crate::scene::{InputEvent, InputState, Key};

/// Pixel-precise scroll deltas are converted at this many pixels per notch
const PIXELS_PER_SCROLL_NOTCH: f32 = 50.0;

/// Counts frames and reports frames per second once per interval
#[derive(Debug, Clone)]
pub struct FpsCounter {
    interval: Duration,
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            interval: Duration::from_millis(500),
            window_start: now,
            frames: 0,
        }
    }

    /// Count one frame. Returns the rate once at least one interval has
    /// passed since the last report.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        let fps = (self.frames as f64 / elapsed.as_secs_f64()).round() as u32;
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}

/// `<title>  ||  FPS: <n>`
pub fn fps_title(title: &str, fps: u32) -> String {
    format!("{}  ||  FPS: {}", title, fps)
}

fn map_key(code: KeyCode) -> Option<Key> {
    match code {
        KeyCode::KeyW => Some(Key::W),
        KeyCode::KeyA => Some(Key::A),
        KeyCode::KeyS => Some(Key::S),
        KeyCode::KeyD => Some(Key::D),
        KeyCode::Space => Some(Key::Space),
        KeyCode::ControlLeft => Some(Key::LeftControl),
        KeyCode::Escape => Some(Key::Escape),
        _ => None,
    }
}

fn look_event(event: &DeviceEvent) -> Option<InputEvent> {
    match event {
        DeviceEvent::MouseMotion { delta } => Some(InputEvent::Look(Vec2::new(delta.0 as f32, delta.1 as f32))),
        _ => None,
    }
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    title: String,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
    fps: FpsCounter,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> RenderResult<Self> {
        let window = WindowBuilder::new()
            .with_title(fps_title(title, 0))
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| BackendError::InitializationFailed(format!("failed to create window: {}", e)))?;

        let size = window.inner_size();
        let window = Self {
            window: Arc::new(window),
            title: title.to_string(),
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
            fps: FpsCounter::new(Instant::now()),
        };
        window.capture_cursor(true);
        Ok(window)
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the window was resized since the last call
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Hide and lock the cursor, or give it back. Platforms without locking
    /// fall back to confining it; look input comes from raw device motion
    /// either way.
    pub fn capture_cursor(&self, capture: bool) {
        let result = if capture {
            self.window
                .set_cursor_grab(CursorGrabMode::Locked)
                .or_else(|_| self.window.set_cursor_grab(CursorGrabMode::Confined))
        } else {
            self.window.set_cursor_grab(CursorGrabMode::None)
        };
        if let Err(e) = result {
            log::warn!("Cursor grab not available: {}", e);
        }
        self.window.set_cursor_visible(!capture);
    }

    /// Count a presented frame and refresh the FPS in the title when due
    pub fn frame_presented(&mut self, now: Instant) {
        if let Some(fps) = self.fps.tick(now) {
            self.window.set_title(&fps_title(&self.title, fps));
        }
    }

    /// Track size and close requests, and queue input for the camera
    pub fn handle_event(&mut self, event: &WindowEvent, input: &mut InputState) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::Focused(focused) => {
                self.capture_cursor(*focused);
                input.push(InputEvent::Focus(*focused));
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        ..
                    },
                ..
            } => {
                if let Some(key) = map_key(*code) {
                    input.push(InputEvent::Key {
                        key,
                        pressed: *state == ElementState::Pressed,
                    });
                }
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let notches = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32 / PIXELS_PER_SCROLL_NOTCH,
                };
                input.push(InputEvent::Scroll(notches));
            }
            _ => {}
        }
    }

    /// Queue raw mouse motion as look input
    pub fn handle_device_event(&self, event: &DeviceEvent, input: &mut InputState) {
        if let Some(look) = look_event(event) {
            input.push(look);
        }
    }
}
