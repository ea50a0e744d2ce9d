//! Asteroid Field - a planet ringed by ten thousand instanced asteroids
//!
//! Renders through a handle-based [`backend::GraphicsBackend`] with a wgpu
//! implementation and a GPU-free recording implementation.
//!
//! # Features
//! - GPU instancing with per-instance transforms and spin speeds
//! - Multisampled offscreen target, explicit resolve, fullscreen composite
//! - Cubemap skybox drawn at the far plane
//! - OBJ model import with generated normals and tangents
//! - WGSL programs validated against the vertex slot layout before use

pub mod app;
pub mod backend;
pub mod error;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod window;

use std::path::PathBuf;

use glam::Vec3;

pub use backend::wgpu_backend::WgpuBackend;
pub use error::{RenderError, RenderResult};
pub use pipeline::{FrameParams, FrameRenderer, RingParams};
pub use resources::CubemapFaces;
pub use window::Window;

/// Scene layout and lighting
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub ring: RingParams,
    /// Seed for asteroid placement; `None` draws from OS entropy
    pub seed: Option<u64>,
    pub camera_position: Vec3,
    pub frame: FrameParams,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            ring: RingParams::default(),
            seed: None,
            camera_position: Vec3::new(-600.0, 0.0, -150.0),
            frame: FrameParams::default(),
        }
    }
}

/// Configuration for the demo application
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title, before the FPS suffix
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Requested MSAA sample count; lowered to the highest supported
    pub sample_count: u32,
    pub shader_dir: PathBuf,
    pub planet_model: PathBuf,
    pub rock_model: PathBuf,
    pub skybox: CubemapFaces,
    pub scene: SceneConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Planet with Asteroids".to_string(),
            width: 1400,
            height: 800,
            vsync: true,
            sample_count: 8,
            shader_dir: PathBuf::from("shaders"),
            planet_model: PathBuf::from("resources/models/planet/planet.obj"),
            rock_model: PathBuf::from("resources/models/rock/rock.obj"),
            skybox: CubemapFaces::in_dir("resources/textures/skybox", "png"),
            scene: SceneConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Point every model and texture path at `root`, keeping the
    /// `models/` and `textures/` layout
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.planet_model = root.join("models/planet/planet.obj");
        self.rock_model = root.join("models/rock/rock.obj");
        self.skybox = CubemapFaces::in_dir(root.join("textures/skybox"), "png");
        self
    }

    pub fn with_asteroid_count(mut self, count: u32) -> Self {
        self.scene.ring.count = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.scene.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_demo_scene() {
        let config = AppConfig::default();
        assert_eq!((config.width, config.height), (1400, 800));
        assert_eq!(config.sample_count, 8);
        assert_eq!(config.scene.ring.count, 10_000);
        assert_eq!(config.scene.frame.clear_color, [0.1, 0.1, 0.1, 1.0]);
        assert_eq!(config.skybox.top, PathBuf::from("resources/textures/skybox/top.png"));
    }

    #[test]
    fn asset_root_moves_every_path() {
        let config = AppConfig::default().with_asset_root("/data").with_seed(9);
        assert_eq!(config.rock_model, PathBuf::from("/data/models/rock/rock.obj"));
        assert_eq!(config.skybox.back, PathBuf::from("/data/textures/skybox/back.png"));
        assert_eq!(config.scene.seed, Some(9));
    }
}
