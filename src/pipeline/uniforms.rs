//! GPU uniform blocks and the scene parameters that fill them

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3, Vec4};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;

/// Per-frame camera and clock block, `@group(0) @binding(0)` in every scene program
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniform {
    pub view: Mat4,
    pub projection: Mat4,
    /// View with the translation removed, for the skybox
    pub sky_view: Mat4,
    /// xyz = camera position
    pub camera_position: Vec4,
    /// x = elapsed seconds, y = asteroid spin rate
    pub time: Vec4,
}

impl FrameUniform {
    pub fn new(view: Mat4, projection: Mat4, camera_position: Vec3, elapsed: f32, spin_rate: f32) -> Self {
        Self {
            view,
            projection,
            sky_view: rotation_only(view),
            camera_position: camera_position.extend(1.0),
            time: Vec4::new(elapsed, spin_rate, 0.0, 0.0),
        }
    }
}

/// Strip the translation from a view matrix, keeping its rotation
pub fn rotation_only(view: Mat4) -> Mat4 {
    Mat4::from_mat3(Mat3::from_mat4(view))
}

/// Point light block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightUniform {
    pub position: Vec4,
    pub color: Vec4,
    /// ambient, diffuse, specular, shininess
    pub terms: Vec4,
}

impl LightUniform {
    pub fn new(light: &PointLight, terms: &LightTerms, shininess: f32) -> Self {
        Self {
            position: light.position.extend(1.0),
            color: light.color.extend(1.0),
            terms: Vec4::new(terms.ambient, terms.diffuse, terms.specular, shininess),
        }
    }
}

/// Per-object block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectUniform {
    pub model: Mat4,
    /// transpose(inverse(model)), for transforming normals
    pub normal_matrix: Mat4,
}

impl ObjectUniform {
    pub fn new(model: Mat4) -> Self {
        Self {
            model,
            normal_matrix: model.inverse().transpose(),
        }
    }
}

impl Default for ObjectUniform {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY)
    }
}

/// Single fixed point light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::new(-500.0, 500.0, -500.0),
            color: Vec3::ONE,
        }
    }
}

/// Phong term weights of one program
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightTerms {
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
}

impl LightTerms {
    pub const PLANET: Self = Self {
        ambient: 0.1,
        diffuse: 1.0,
        specular: 0.0,
    };

    pub const ASTEROIDS: Self = Self {
        ambient: 0.1,
        diffuse: 0.8,
        specular: 0.2,
    };
}

/// Planet placement and spin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanetParams {
    pub scale: f32,
    /// Degrees per second around +Y
    pub rotation_speed: f32,
    pub offset: Vec3,
}

impl Default for PlanetParams {
    fn default() -> Self {
        Self {
            scale: 10.0,
            rotation_speed: 2.5,
            offset: Vec3::new(0.0, -1.2, 0.0),
        }
    }
}

impl PlanetParams {
    /// scale · rotate_y(t) · translate(offset)
    pub fn model_matrix(&self, elapsed: f32) -> Mat4 {
        Mat4::from_scale(Vec3::splat(self.scale))
            * Mat4::from_rotation_y((elapsed * self.rotation_speed).to_radians())
            * Mat4::from_translation(self.offset)
    }
}

/// A uniform buffer holding one `T`
#[derive(Debug)]
pub struct UniformBuffer<T: Pod> {
    buffer: BufferHandle,
    value: T,
}

impl<T: Pod> UniformBuffer<T> {
    pub fn new<B: GraphicsBackend>(backend: &mut B, label: &str, value: T) -> RenderResult<Self> {
        let buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(label.to_string()),
                size: std::mem::size_of::<T>() as u64,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            },
            bytemuck::bytes_of(&value),
        )?;
        Ok(Self { buffer, value })
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn write<B: GraphicsBackend>(&mut self, backend: &mut B, value: T) {
        self.value = value;
        backend.write_buffer(self.buffer, 0, bytemuck::bytes_of(&value));
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn uniform_blocks_keep_std140_friendly_sizes() {
        assert_eq!(std::mem::size_of::<FrameUniform>(), 3 * 64 + 2 * 16);
        assert_eq!(std::mem::size_of::<LightUniform>(), 48);
        assert_eq!(std::mem::size_of::<ObjectUniform>(), 128);
    }

    #[test]
    fn sky_view_drops_translation() {
        let view = Mat4::look_at_rh(Vec3::new(5.0, 2.0, -3.0), Vec3::ZERO, Vec3::Y);
        let frame = FrameUniform::new(view, Mat4::IDENTITY, Vec3::ZERO, 0.0, 10.0);
        assert_eq!(frame.sky_view.w_axis, Vec4::W);
        assert!(frame.sky_view.transform_vector3(Vec3::X).abs_diff_eq(view.transform_vector3(Vec3::X), 1e-6));
    }

    #[test]
    fn planet_offset_is_applied_before_spin() {
        let planet = PlanetParams::default();
        let origin = planet.model_matrix(36.0).transform_point3(Vec3::ZERO);
        // Rotation about Y leaves a pure Y offset unchanged; scale multiplies it
        assert!(origin.abs_diff_eq(Vec3::new(0.0, -12.0, 0.0), 1e-4));
    }

    #[test]
    fn normal_matrix_is_inverse_transpose() {
        let model = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let object = ObjectUniform::new(model);
        let n = object.normal_matrix.transform_vector3(Vec3::X);
        assert!(n.abs_diff_eq(Vec3::new(0.5, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn writes_reach_the_buffer() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut light = UniformBuffer::new(
            &mut backend,
            "light",
            LightUniform::new(&PointLight::default(), &LightTerms::PLANET, 64.0),
        )
        .unwrap();
        let updated = LightUniform::new(&PointLight::default(), &LightTerms::ASTEROIDS, 64.0);
        light.write(&mut backend, updated);
        assert_eq!(
            backend.buffer_contents(light.handle()),
            Some(bytemuck::bytes_of(&updated))
        );
    }
}
