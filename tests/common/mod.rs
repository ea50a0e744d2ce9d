//! Shared fixtures for the integration tests.
//!
//! Scenes are built from in-memory meshes and images so that the recording
//! backend and the headless wgpu backend can both render them without any
//! asset files.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glam::{Vec2, Vec3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use asteroid_field::backend::{GraphicsBackend, Vertex, WgpuBackend};
use asteroid_field::error::{RenderError, RenderResult};
use asteroid_field::pipeline::{InstanceData, InstancedModel, RingParams, SceneAssets};
use asteroid_field::resources::{
    CubemapFaces, DecodedImage, ImageSource, ImportedMesh, MeshData, Model, TextureCache, TextureRole,
};

pub const PLANET_TEXTURE: &str = "planet/surface.png";
pub const ROCK_TEXTURE: &str = "rock/rock.png";
pub const SKY_DIR: &str = "skybox";

/// Image source backed by a map of path to decoded image
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    images: HashMap<PathBuf, DecodedImage>,
}

impl MemorySource {
    pub fn with(mut self, path: impl Into<PathBuf>, image: DecodedImage) -> Self {
        self.images.insert(path.into(), image);
        self
    }

    /// Textures for the test scene; every skybox face is `sky_rgba`
    pub fn scene(sky_rgba: [u8; 4]) -> Self {
        let mut source = Self::default()
            .with(PLANET_TEXTURE, DecodedImage::solid(4, 4, [255, 255, 255, 255]))
            .with(ROCK_TEXTURE, DecodedImage::solid(4, 4, [120, 110, 100, 255]));
        for face in CubemapFaces::in_dir(SKY_DIR, "png").ordered() {
            source = source.with(face, DecodedImage::solid(8, 8, sky_rgba));
        }
        source
    }
}

impl ImageSource for MemorySource {
    fn decode(&mut self, path: &Path) -> RenderResult<DecodedImage> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| RenderError::TextureDecodeFailure {
                path: path.to_path_buf(),
                reason: "not in memory source".into(),
            })
    }
}

/// Bundled WGSL programs
pub fn shader_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders")
}

/// Square facing +Z spanning `[-half, half]` in x and y at depth `z`
pub fn quad(name: &str, half: f32, z: f32) -> MeshData {
    let corner = |x: f32, y: f32| {
        Vertex::new(
            Vec3::new(x * half, y * half, z),
            Vec3::Z,
            Vec2::new((x + 1.0) * 0.5, (y + 1.0) * 0.5),
        )
    };
    MeshData::new(
        name,
        vec![
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, 1.0),
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
}

fn imported(mesh: MeshData, texture: Option<&str>) -> ImportedMesh {
    ImportedMesh {
        mesh,
        texture_paths: texture
            .map(|path| vec![(TextureRole::Diffuse, PathBuf::from(path))])
            .unwrap_or_default(),
    }
}

/// What goes into a test scene
#[derive(Debug, Clone)]
pub struct SceneSpec {
    /// Planet meshes; the first is textured, the rest use the placeholder
    pub planet_meshes: Vec<MeshData>,
    pub rock_meshes: Vec<MeshData>,
    pub asteroid_count: u32,
    pub seed: u64,
    pub sky_rgba: [u8; 4],
}

impl Default for SceneSpec {
    fn default() -> Self {
        Self {
            planet_meshes: vec![quad("planet-a", 1.0, 0.0), quad("planet-b", 0.5, 0.2)],
            rock_meshes: vec![quad("rock", 0.3, 0.0)],
            asteroid_count: 250,
            seed: 42,
            sky_rgba: [0, 0, 255, 255],
        }
    }
}

pub fn build_scene<B: GraphicsBackend>(backend: &mut B, spec: SceneSpec) -> SceneAssets<MemorySource> {
    let source = MemorySource::scene(spec.sky_rgba);

    let planet_meshes = spec
        .planet_meshes
        .into_iter()
        .enumerate()
        .map(|(i, mesh)| imported(mesh, (i == 0).then_some(PLANET_TEXTURE)))
        .collect();
    let planet = Model::from_imported(backend, "planet", planet_meshes, source.clone()).unwrap();

    let rock_meshes = spec
        .rock_meshes
        .into_iter()
        .map(|mesh| imported(mesh, Some(ROCK_TEXTURE)))
        .collect();
    let rock = Model::from_imported(backend, "rock", rock_meshes, source.clone()).unwrap();

    let ring = RingParams {
        count: spec.asteroid_count,
        ..Default::default()
    };
    let data = InstanceData::generate(&ring, &mut ChaCha8Rng::seed_from_u64(spec.seed));
    let asteroids = InstancedModel::new(backend, rock, data).unwrap();

    let mut sky_textures = TextureCache::new(source);
    let skybox = sky_textures
        .load_cubemap(backend, &CubemapFaces::in_dir(SKY_DIR, "png"))
        .unwrap();

    SceneAssets {
        planet,
        asteroids,
        sky_textures,
        skybox,
    }
}

/// Headless wgpu backend, or `None` when this machine has no usable adapter
pub fn headless(width: u32, height: u32) -> Option<WgpuBackend> {
    match WgpuBackend::new_headless(width, height) {
        Ok(backend) => Some(backend),
        Err(e) => {
            eprintln!("No GPU adapter available, skipping: {}", e);
            None
        }
    }
}

/// RGBA8 pixel at (x, y) of a tightly packed image `width` pixels wide
pub fn pixel(pixels: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let i = ((y * width + x) * 4) as usize;
    [pixels[i], pixels[i + 1], pixels[i + 2], pixels[i + 3]]
}

pub fn assert_pixel_near(actual: [u8; 4], expected: [u8; 4], tolerance: u8) {
    for (a, e) in actual.iter().zip(expected) {
        assert!(
            a.abs_diff(e) <= tolerance,
            "pixel {:?} differs from {:?} by more than {}",
            actual,
            expected,
            tolerance
        );
    }
}
