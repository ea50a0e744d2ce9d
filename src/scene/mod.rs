//! Camera and input handling

mod camera;
mod input;

pub use camera::*;
pub use input::*;
