//! Free-fly camera driven by discrete events

use glam::{Mat4, Vec3};

/// Perspective parameters; the aspect ratio comes from the viewport each frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fov_y_degrees: 45.0,
            near: 0.1,
            far: 10_000.0,
        }
    }
}

impl Projection {
    /// Right-handed perspective with depth in `[0, 1]`. A degenerate viewport
    /// falls back to a square aspect.
    pub fn matrix(&self, width: u32, height: u32) -> Mat4 {
        let aspect = if width == 0 || height == 0 {
            1.0
        } else {
            width as f32 / height as f32
        };
        Mat4::perspective_rh(self.fov_y_degrees.to_radians(), aspect, self.near, self.far)
    }
}

/// Movement directions, relative to where the camera faces except for
/// `Up`/`Down` which follow world Y
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveDirection {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
}

/// What the camera reacts to. Produced by [`super::InputState`] once per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraEvent {
    /// Move for `dt` seconds at the camera's speed
    Move { direction: MoveDirection, dt: f32 },
    /// Cursor delta in pixels; +y is down the screen
    Look { dx: f32, dy: f32 },
    /// Scroll notches; positive moves toward the view direction
    Zoom(f32),
}

const PITCH_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

/// Yaw/pitch camera. Yaw 0 faces +X, positive pitch looks down.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Radians around world Y
    pub yaw: f32,
    /// Radians, clamped short of straight up/down
    pub pitch: f32,
    /// Units per second
    pub move_speed: f32,
    /// Radians per pixel
    pub mouse_sensitivity: f32,
    /// Units per scroll notch
    pub zoom_step: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::ZERO)
    }
}

impl Camera {
    /// Camera at `position` facing -Z.
    ///
    /// The demo app turns its camera toward the origin with [`Camera::look_at`]
    /// so the planet is in view on the first frame.
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            yaw: -std::f32::consts::FRAC_PI_2,
            pitch: 0.0,
            move_speed: 100.0,
            mouse_sensitivity: 0.003,
            zoom_step: 20.0,
        }
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.move_speed = speed;
        self
    }

    /// Turn to face `target`. Leaves the orientation alone when the target
    /// coincides with the camera.
    pub fn look_at(mut self, target: Vec3) -> Self {
        let Some(forward) = (target - self.position).try_normalize() else {
            return self;
        };
        self.yaw = forward.z.atan2(forward.x);
        self.pitch = (-forward.y).asin().clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            -self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    /// Horizontal right vector
    pub fn right(&self) -> Vec3 {
        Vec3::new(-self.yaw.sin(), 0.0, self.yaw.cos())
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    pub fn apply(&mut self, event: CameraEvent) {
        match event {
            CameraEvent::Move { direction, dt } => {
                let step = self.move_speed * dt;
                let offset = match direction {
                    MoveDirection::Forward => self.forward(),
                    MoveDirection::Backward => -self.forward(),
                    MoveDirection::Right => self.right(),
                    MoveDirection::Left => -self.right(),
                    MoveDirection::Up => Vec3::Y,
                    MoveDirection::Down => Vec3::NEG_Y,
                };
                self.position += offset * step;
            }
            CameraEvent::Look { dx, dy } => {
                self.yaw += dx * self.mouse_sensitivity;
                self.pitch = (self.pitch + dy * self.mouse_sensitivity).clamp(-PITCH_LIMIT, PITCH_LIMIT);
            }
            CameraEvent::Zoom(notches) => {
                self.position += self.forward() * notches * self.zoom_step;
            }
        }
    }
}
