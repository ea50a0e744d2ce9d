//! Window input queued as events and drained once per frame

use std::collections::{HashSet, VecDeque};

use glam::Vec2;

use super::camera::{CameraEvent, MoveDirection};

/// Keys the demo reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    Space,
    LeftControl,
    Escape,
}

impl Key {
    fn direction(self) -> Option<MoveDirection> {
        match self {
            Key::W => Some(MoveDirection::Forward),
            Key::S => Some(MoveDirection::Backward),
            Key::A => Some(MoveDirection::Left),
            Key::D => Some(MoveDirection::Right),
            Key::Space => Some(MoveDirection::Up),
            Key::LeftControl => Some(MoveDirection::Down),
            Key::Escape => None,
        }
    }
}

/// Raw input captured from the window system
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Key { key: Key, pressed: bool },
    /// Relative mouse motion in pixels, unbounded by the window edge
    Look(Vec2),
    /// Vertical scroll in notches
    Scroll(f32),
    Focus(bool),
}

/// Result of draining one frame's worth of input
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameInput {
    pub camera: Vec<CameraEvent>,
    pub quit: bool,
}

/// Event queue plus the state needed to turn it into camera events.
///
/// Held movement keys emit one `Move` per frame for as long as they stay
/// down. Motion is ignored while the window is unfocused, and the first
/// motion sample after focus is regained is dropped.
#[derive(Debug, Default)]
pub struct InputState {
    queue: VecDeque<InputEvent>,
    held: HashSet<Key>,
    unfocused: bool,
    skip_next_look: bool,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: InputEvent) {
        self.queue.push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_held(&self, key: Key) -> bool {
        self.held.contains(&key)
    }

    /// Consume every queued event
    pub fn drain(&mut self, dt: f32) -> FrameInput {
        let mut frame = FrameInput::default();
        let mut look = Vec2::ZERO;
        let mut zoom = 0.0;

        while let Some(event) = self.queue.pop_front() {
            match event {
                InputEvent::Key { key, pressed } => {
                    if pressed {
                        if key == Key::Escape {
                            frame.quit = true;
                        }
                        self.held.insert(key);
                    } else {
                        self.held.remove(&key);
                    }
                }
                InputEvent::Look(delta) => {
                    if self.unfocused {
                        continue;
                    }
                    if std::mem::take(&mut self.skip_next_look) {
                        continue;
                    }
                    look += delta;
                }
                InputEvent::Scroll(notches) => zoom += notches,
                InputEvent::Focus(focused) => {
                    self.unfocused = !focused;
                    self.skip_next_look = focused;
                    if !focused {
                        self.held.clear();
                    }
                }
            }
        }

        // Fixed order keeps frames reproducible regardless of hash order
        const ORDER: [Key; 6] = [Key::W, Key::S, Key::A, Key::D, Key::Space, Key::LeftControl];
        frame.camera.extend(
            ORDER
                .iter()
                .filter(|key| self.held.contains(key))
                .filter_map(|key| key.direction())
                .map(|direction| CameraEvent::Move { direction, dt }),
        );
        if look != Vec2::ZERO {
            frame.camera.push(CameraEvent::Look { dx: look.x, dy: look.y });
        }
        if zoom != 0.0 {
            frame.camera.push(CameraEvent::Zoom(zoom));
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::scene::Camera;

    fn press(key: Key) -> InputEvent {
        InputEvent::Key { key, pressed: true }
    }

    #[test]
    fn held_keys_repeat_every_frame() {
        let mut input = InputState::new();
        input.push(press(Key::W));
        input.push(press(Key::Space));

        let first = input.drain(0.016);
        assert_eq!(
            first.camera,
            vec![
                CameraEvent::Move {
                    direction: MoveDirection::Forward,
                    dt: 0.016
                },
                CameraEvent::Move {
                    direction: MoveDirection::Up,
                    dt: 0.016
                },
            ]
        );

        input.push(InputEvent::Key {
            key: Key::Space,
            pressed: false,
        });
        let second = input.drain(0.02);
        assert_eq!(second.camera.len(), 1);
        assert!(input.is_held(Key::W));
    }

    #[test]
    fn motion_deltas_accumulate_per_frame() {
        let mut input = InputState::new();
        input.push(InputEvent::Look(Vec2::new(6.0, -2.0)));
        input.push(InputEvent::Look(Vec2::new(4.0, -3.0)));
        assert_eq!(
            input.drain(0.0).camera,
            vec![CameraEvent::Look { dx: 10.0, dy: -5.0 }]
        );
    }

    #[test]
    fn identical_deltas_keep_turning_the_camera() {
        // A pinned cursor would report zero after the first frame; relative
        // motion must keep rotating for as long as the mouse moves.
        let mut input = InputState::new();
        let mut camera = Camera::new(Vec3::ZERO);
        let mut yaws = vec![camera.yaw];
        for _ in 0..5 {
            input.push(InputEvent::Look(Vec2::new(40.0, 0.0)));
            for event in input.drain(0.016).camera {
                camera.apply(event);
            }
            yaws.push(camera.yaw);
        }
        assert!(yaws.windows(2).all(|pair| pair[1] > pair[0]), "yaw stalled: {:?}", yaws);
        let step = yaws[1] - yaws[0];
        assert!((yaws[5] - yaws[0] - 5.0 * step).abs() < 1e-4);
    }

    #[test]
    fn motion_is_dropped_while_unfocused_and_just_after_refocus() {
        let mut input = InputState::new();
        input.push(InputEvent::Focus(false));
        input.push(InputEvent::Look(Vec2::new(25.0, 0.0)));
        assert!(input.drain(0.0).camera.is_empty());

        input.push(InputEvent::Focus(true));
        input.push(InputEvent::Look(Vec2::new(300.0, 120.0)));
        input.push(InputEvent::Look(Vec2::new(3.0, 1.0)));
        assert_eq!(input.drain(0.0).camera, vec![CameraEvent::Look { dx: 3.0, dy: 1.0 }]);
    }

    #[test]
    fn losing_focus_releases_keys() {
        let mut input = InputState::new();
        input.push(press(Key::D));
        input.push(InputEvent::Focus(false));
        assert!(input.drain(0.1).camera.is_empty());
        assert!(!input.is_held(Key::D));
    }

    #[test]
    fn escape_requests_quit_and_scroll_accumulates() {
        let mut input = InputState::new();
        input.push(InputEvent::Scroll(1.0));
        input.push(InputEvent::Scroll(2.0));
        input.push(press(Key::Escape));
        let frame = input.drain(0.0);
        assert!(frame.quit);
        assert_eq!(frame.camera, vec![CameraEvent::Zoom(3.0)]);
        assert_eq!(input.pending(), 0);
    }
}
