//! Asteroid ring placement and instanced drawing

use glam::{Mat4, Quat, Vec3};
use rand::Rng;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::resources::{FileImageSource, ImageSource, Model, TextureRef, TextureRole};

/// Ring distribution parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingParams {
    pub count: u32,
    pub radius: f32,
    /// Half-width of the uniform jitter on each axis
    pub offset: f32,
    /// Rotation axis shared by every instance; normalized before use
    pub axis: Vec3,
    /// Uniform scale, `[min, max)`
    pub scale_range: (f32, f32),
    /// Spin speed, `[min, max)`
    pub speed_range: (f32, f32),
}

impl Default for RingParams {
    fn default() -> Self {
        Self {
            count: 10_000,
            radius: 500.0,
            offset: 100.0,
            axis: Vec3::new(0.4, 0.6, 0.8),
            scale_range: (0.1, 0.3),
            speed_range: (0.0, 10.0),
        }
    }
}

/// Flattening applied to the vertical jitter
pub const VERTICAL_JITTER_SCALE: f32 = 0.4;

/// One generated instance before it is packed into a matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsteroidPlacement {
    /// Angle around the ring in degrees
    pub angle: f32,
    pub jitter: Vec3,
    pub position: Vec3,
    pub scale: f32,
    /// Degrees around the ring's shared axis
    pub rotation: f32,
    pub speed: f32,
}

impl AsteroidPlacement {
    /// translate(position) · rotate(rotation, axis) · scale(scale)
    pub fn transform(&self, axis: Vec3) -> Mat4 {
        Mat4::from_translation(self.position)
            * Mat4::from_quat(Quat::from_axis_angle(axis.normalize_or_zero(), self.rotation.to_radians()))
            * Mat4::from_scale(Vec3::splat(self.scale))
    }
}

fn sample_half_open<R: Rng>(rng: &mut R, (min, max): (f32, f32)) -> f32 {
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

/// Place `params.count` instances around the ring.
///
/// Per instance the generator is drawn in a fixed order: jitter x, y, z,
/// scale, rotation, speed. The same seed therefore always yields the same
/// ring.
pub fn generate_placements<R: Rng>(params: &RingParams, rng: &mut R) -> Vec<AsteroidPlacement> {
    let offset = params.offset.abs();
    let count = params.count.max(1) as f32;
    (0..params.count)
        .map(|i| {
            let angle = i as f32 / count * 360.0;
            let mut jitter = || rng.gen_range(-offset..=offset);
            let dx = jitter();
            let dy = jitter() * VERTICAL_JITTER_SCALE;
            let dz = jitter();
            let jitter = Vec3::new(dx, dy, dz);

            let (sin, cos) = angle.to_radians().sin_cos();
            let position = Vec3::new(sin * params.radius, 0.0, cos * params.radius) + jitter;

            let scale = sample_half_open(rng, params.scale_range);
            let rotation = rng.gen_range(0.0..360.0);
            let speed = sample_half_open(rng, params.speed_range);

            AsteroidPlacement {
                angle,
                jitter,
                position,
                scale,
                rotation,
                speed,
            }
        })
        .collect()
}

/// Parallel per-instance arrays; index i of each describes the same asteroid
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceData {
    pub transforms: Vec<Mat4>,
    pub speeds: Vec<f32>,
}

impl InstanceData {
    pub fn generate<R: Rng>(params: &RingParams, rng: &mut R) -> Self {
        Self::from_placements(&generate_placements(params, rng), params.axis)
    }

    pub fn from_placements(placements: &[AsteroidPlacement], axis: Vec3) -> Self {
        Self {
            transforms: placements.iter().map(|p| p.transform(axis)).collect(),
            speeds: placements.iter().map(|p| p.speed).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

/// A model drawn once per instance of a fixed instance set.
///
/// The instance buffers are uploaded once and never rewritten; spin is
/// evaluated in the vertex stage from elapsed time and each instance's speed.
pub struct InstancedModel<S: ImageSource = FileImageSource> {
    model: Model<S>,
    data: InstanceData,
    buffers: Option<(BufferHandle, BufferHandle)>,
}

impl<S: ImageSource> InstancedModel<S> {
    /// Upload the instance buffers and wire them into every mesh
    pub fn new<B: GraphicsBackend>(backend: &mut B, mut model: Model<S>, data: InstanceData) -> RenderResult<Self> {
        if data.is_empty() {
            log::warn!("Instanced model {} has no instances", model.name());
            return Ok(Self {
                model,
                data,
                buffers: None,
            });
        }

        let transforms = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Instance Transforms".into()),
                size: (data.len() * std::mem::size_of::<Mat4>()) as u64,
                usage: BufferUsage::VERTEX,
            },
            bytemuck::cast_slice(&data.transforms),
        )?;
        let speeds = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Instance Speeds".into()),
                size: (data.len() * std::mem::size_of::<f32>()) as u64,
                usage: BufferUsage::VERTEX,
            },
            bytemuck::cast_slice(&data.speeds),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.destroy_buffer(transforms);
                return Err(e.into());
            }
        };

        let count = data.len() as u32;
        for mesh in model.meshes_mut() {
            mesh.geometry.configure(transforms, speeds, count);
        }
        log::info!(
            "Instanced {} x{} across {} meshes",
            model.name(),
            count,
            model.meshes().len()
        );

        Ok(Self {
            model,
            data,
            buffers: Some((transforms, speeds)),
        })
    }

    pub fn model(&self) -> &Model<S> {
        &self.model
    }

    pub fn data(&self) -> &InstanceData {
        &self.data
    }

    pub fn instance_count(&self) -> u32 {
        self.data.len() as u32
    }

    /// First diffuse texture of the model, shared by every instance
    pub fn diffuse_texture(&self) -> Option<TextureRef> {
        self.model
            .meshes()
            .iter()
            .find_map(|m| m.data.texture(TextureRole::Diffuse))
    }

    /// One instanced draw per mesh. The pipeline and bind groups must already
    /// be set.
    pub fn draw_instanced<B: GraphicsBackend>(&self, backend: &mut B) {
        if self.buffers.is_none() {
            return;
        }
        for mesh in self.model.meshes() {
            mesh.geometry.draw(backend);
        }
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        if let Some((transforms, speeds)) = self.buffers {
            backend.destroy_buffer(transforms);
            backend.destroy_buffer(speeds);
        }
        self.model.destroy(backend);
    }
}
