//! Backend abstraction layer
//!
//! Provides the handle-based [`GraphicsBackend`] trait with a wgpu
//! implementation and a recording implementation that needs no GPU.

pub mod recording;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use recording::{RecordedCommand, RecordingBackend, ResourceKind};
pub use traits::*;
pub use types::*;
pub use wgpu_backend::WgpuBackend;
