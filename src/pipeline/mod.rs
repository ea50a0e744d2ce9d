//! Forward MSAA rendering pipeline
//!
//! Geometry and instance buffers, the multisampled offscreen target with its
//! resolve texture, the four render programs and the per-frame orchestration
//! that ties them together.

pub mod frame;
pub mod geometry_buffer;
pub mod instancing;
pub mod offscreen;
pub mod programs;
pub mod uniforms;

pub use frame::{FrameParams, FrameRenderer, SceneAssets, SCENE_COLOR_FORMAT};
pub use geometry_buffer::{GeometryBuffer, InstanceBuffers};
pub use instancing::{generate_placements, AsteroidPlacement, InstanceData, InstancedModel, RingParams};
pub use offscreen::{choose_sample_count, OffscreenTarget, TargetState};
pub use programs::{BindingLayouts, Programs, RenderProgram, TargetFormats};
pub use uniforms::*;
