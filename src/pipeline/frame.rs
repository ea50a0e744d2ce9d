//! Per-frame orchestration
//!
//! One frame is three passes:
//! 1. Scene pass into the multisampled [`OffscreenTarget`]: planet meshes,
//!    the instanced asteroid ring, then the skybox at the far plane.
//! 2. Resolve of the multisampled color into the single-sample texture.
//! 3. Composite pass sampling the resolved texture onto the swapchain with a
//!    fullscreen quad.

use std::path::Path;

use bytemuck::Zeroable;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::pipeline::instancing::InstancedModel;
use crate::pipeline::offscreen::{choose_sample_count, OffscreenTarget};
use crate::pipeline::programs::{Programs, TargetFormats};
use crate::pipeline::uniforms::*;
use crate::resources::{
    Cubemap, FileImageSource, ImageSource, Model, TextureCache, TextureRef, TextureRole, SCREEN_QUAD_VERTICES,
    SKYBOX_VERTICES,
};
use crate::scene::{Camera, Projection};

/// Color format of the scene and resolve textures
pub const SCENE_COLOR_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Fixed scene parameters consumed every frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
    pub clear_color: [f32; 4],
    pub projection: Projection,
    /// Multiplier on elapsed time for asteroid spin
    pub spin_rate: f32,
    pub shininess: f32,
    pub light: PointLight,
    pub planet: PlanetParams,
    pub planet_terms: LightTerms,
    pub asteroid_terms: LightTerms,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.1, 0.1, 1.0],
            projection: Projection::default(),
            spin_rate: 10.0,
            shininess: 64.0,
            light: PointLight::default(),
            planet: PlanetParams::default(),
            planet_terms: LightTerms::PLANET,
            asteroid_terms: LightTerms::ASTEROIDS,
        }
    }
}

/// Everything drawn in the scene pass
pub struct SceneAssets<S: ImageSource = FileImageSource> {
    pub planet: Model<S>,
    pub asteroids: InstancedModel<S>,
    /// Owns the skybox cubemap
    pub sky_textures: TextureCache<S>,
    pub skybox: Cubemap,
}

impl<S: ImageSource> SceneAssets<S> {
    pub fn destroy<B: GraphicsBackend>(mut self, backend: &mut B) {
        self.planet.destroy(backend);
        self.asteroids.destroy(backend);
        self.sky_textures.destroy(backend);
    }
}

/// Renderer-owned handles, tracked so a failed construction can release
/// whatever it already created
#[derive(Debug, Default)]
struct Allocations {
    buffers: Vec<BufferHandle>,
    bind_groups: Vec<BindGroupHandle>,
    samplers: Vec<SamplerHandle>,
}

impl Allocations {
    fn buffer<B: GraphicsBackend>(&mut self, backend: &mut B, label: &str, data: &[u8]) -> RenderResult<BufferHandle> {
        let buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(label.to_string()),
                size: data.len() as u64,
                usage: BufferUsage::VERTEX,
            },
            data,
        )?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    fn uniform<B: GraphicsBackend, T: bytemuck::Pod>(
        &mut self,
        backend: &mut B,
        label: &str,
        value: T,
    ) -> RenderResult<UniformBuffer<T>> {
        let uniform = UniformBuffer::new(backend, label, value)?;
        self.buffers.push(uniform.handle());
        Ok(uniform)
    }

    fn bind_group<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> RenderResult<BindGroupHandle> {
        let group = backend.create_bind_group(layout, entries)?;
        self.bind_groups.push(group);
        Ok(group)
    }

    fn sampled<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        layout: BindGroupLayoutHandle,
        view: TextureViewHandle,
        sampler: SamplerHandle,
    ) -> RenderResult<BindGroupHandle> {
        self.bind_group(
            backend,
            layout,
            &[(0, BindGroupEntry::Texture(view)), (1, BindGroupEntry::Sampler(sampler))],
        )
    }

    fn release<B: GraphicsBackend>(self, backend: &mut B) {
        for group in self.bind_groups {
            backend.destroy_bind_group(group);
        }
        for buffer in self.buffers {
            backend.destroy_buffer(buffer);
        }
        for sampler in self.samplers {
            backend.destroy_sampler(sampler);
        }
    }
}

struct Uniforms {
    frame: UniformBuffer<FrameUniform>,
    planet_object: UniformBuffer<ObjectUniform>,
    planet_light: UniformBuffer<LightUniform>,
    asteroid_light: UniformBuffer<LightUniform>,
}

struct BindGroups {
    frame: BindGroupHandle,
    planet_lighting: BindGroupHandle,
    asteroid_light: BindGroupHandle,
    /// One per planet mesh, in mesh order
    planet_materials: Vec<BindGroupHandle>,
    asteroid_material: BindGroupHandle,
    skybox: BindGroupHandle,
    composite: BindGroupHandle,
}

/// Owns the scene, its programs, the offscreen target and every per-frame
/// GPU object, and records one complete frame per [`FrameRenderer::render`].
pub struct FrameRenderer<S: ImageSource = FileImageSource> {
    params: FrameParams,
    scene: SceneAssets<S>,
    programs: Programs,
    target: OffscreenTarget,
    uniforms: Uniforms,
    groups: BindGroups,
    composite_sampler: SamplerHandle,
    skybox_vertices: BufferHandle,
    quad_vertices: BufferHandle,
    allocations: Allocations,
}

impl<S: ImageSource> FrameRenderer<S> {
    /// Build the target at the current surface size, load the programs from
    /// `shader_dir` and wire the scene's resources into bind groups.
    ///
    /// On failure every object created here is released and the scene is
    /// destroyed.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        mut scene: SceneAssets<S>,
        shader_dir: &Path,
        requested_samples: u32,
        params: FrameParams,
    ) -> RenderResult<Self> {
        let mut target = OffscreenTarget::new(SCENE_COLOR_FORMAT);
        let sample_count = choose_sample_count(backend, target.color_format(), target.depth_format(), requested_samples);
        let (width, height) = backend.surface_size();

        let formats = TargetFormats {
            scene_color: target.color_format(),
            scene_depth: target.depth_format(),
            sample_count,
            present: backend.swapchain_format(),
        };
        let programs = target
            .create(backend, width, height, sample_count)
            .and_then(|()| Programs::load(backend, shader_dir, formats));
        let programs = match programs {
            Ok(programs) => programs,
            Err(e) => {
                target.destroy(backend);
                scene.destroy(backend);
                return Err(e);
            }
        };

        let mut allocations = Allocations::default();
        match Self::allocate(backend, &mut scene, &programs, &target, &params, &mut allocations) {
            Ok((uniforms, groups, composite_sampler, skybox_vertices, quad_vertices)) => {
                log::info!(
                    "Frame renderer ready: {}x{} at {}x MSAA, {} planet meshes, {} asteroids",
                    width,
                    height,
                    sample_count,
                    scene.planet.meshes().len(),
                    scene.asteroids.instance_count()
                );
                Ok(Self {
                    params,
                    scene,
                    programs,
                    target,
                    uniforms,
                    groups,
                    composite_sampler,
                    skybox_vertices,
                    quad_vertices,
                    allocations,
                })
            }
            Err(e) => {
                allocations.release(backend);
                programs.destroy(backend);
                target.destroy(backend);
                scene.destroy(backend);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn allocate<B: GraphicsBackend>(
        backend: &mut B,
        scene: &mut SceneAssets<S>,
        programs: &Programs,
        target: &OffscreenTarget,
        params: &FrameParams,
        allocations: &mut Allocations,
    ) -> RenderResult<(Uniforms, BindGroups, SamplerHandle, BufferHandle, BufferHandle)> {
        let layouts = programs.layouts;
        let uniforms = Uniforms {
            frame: allocations.uniform(backend, "Frame Uniform", FrameUniform::zeroed())?,
            planet_object: allocations.uniform(backend, "Planet Object", ObjectUniform::default())?,
            planet_light: allocations.uniform(
                backend,
                "Planet Light",
                LightUniform::new(&params.light, &params.planet_terms, params.shininess),
            )?,
            asteroid_light: allocations.uniform(
                backend,
                "Asteroid Light",
                LightUniform::new(&params.light, &params.asteroid_terms, params.shininess),
            )?,
        };

        let skybox_vertices = allocations.buffer(backend, "Skybox Vertices", bytemuck::cast_slice(&SKYBOX_VERTICES))?;
        let quad_vertices =
            allocations.buffer(backend, "Screen Quad Vertices", bytemuck::cast_slice(&SCREEN_QUAD_VERTICES))?;
        let composite_sampler = backend.create_sampler(&SamplerDescriptor::clamped("Composite Sampler"))?;
        allocations.samplers.push(composite_sampler);

        // Meshes without a diffuse map sample plain white
        let placeholder: TextureRef = scene
            .planet
            .textures_mut()
            .solid_color(backend, "white", [255, 255, 255, 255])?;

        let frame = allocations.bind_group(
            backend,
            layouts.frame,
            &[(0, BindGroupEntry::Buffer(uniforms.frame.handle()))],
        )?;
        let planet_lighting = allocations.bind_group(
            backend,
            layouts.lighting,
            &[
                (0, BindGroupEntry::Buffer(uniforms.planet_object.handle())),
                (1, BindGroupEntry::Buffer(uniforms.planet_light.handle())),
            ],
        )?;
        let asteroid_light = allocations.bind_group(
            backend,
            layouts.light,
            &[(0, BindGroupEntry::Buffer(uniforms.asteroid_light.handle()))],
        )?;

        let mut planet_materials = Vec::with_capacity(scene.planet.meshes().len());
        for mesh in scene.planet.meshes() {
            let texture = mesh.data.texture(TextureRole::Diffuse).unwrap_or(placeholder);
            planet_materials.push(allocations.sampled(backend, layouts.material, texture.view, texture.sampler)?);
        }
        let asteroid_texture = scene.asteroids.diffuse_texture().unwrap_or(placeholder);
        let asteroid_material =
            allocations.sampled(backend, layouts.material, asteroid_texture.view, asteroid_texture.sampler)?;
        let sky = scene.skybox.texture;
        let skybox = allocations.sampled(backend, layouts.cubemap, sky.view, sky.sampler)?;
        let composite = allocations.sampled(backend, layouts.composite, target.resolve_view()?, composite_sampler)?;

        Ok((
            uniforms,
            BindGroups {
                frame,
                planet_lighting,
                asteroid_light,
                planet_materials,
                asteroid_material,
                skybox,
                composite,
            },
            composite_sampler,
            skybox_vertices,
            quad_vertices,
        ))
    }

    pub fn params(&self) -> &FrameParams {
        &self.params
    }

    pub fn scene(&self) -> &SceneAssets<S> {
        &self.scene
    }

    pub fn programs(&self) -> &Programs {
        &self.programs
    }

    pub fn target(&self) -> &OffscreenTarget {
        &self.target
    }

    /// Record and present one frame. `elapsed` is seconds since start and
    /// drives planet rotation and asteroid spin.
    pub fn render<B: GraphicsBackend>(&mut self, backend: &mut B, camera: &Camera, elapsed: f32) -> RenderResult<()> {
        // Fail on an unusable target before a frame is opened
        let scene_pass = self.target.scene_pass(self.params.clear_color)?;
        let (width, height) = self.target.size().unwrap_or((1, 1));

        let frame = backend.begin_frame()?;
        self.write_uniforms(backend, camera, elapsed, width, height);

        backend.begin_render_pass(&scene_pass);
        backend.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        self.draw_planet(backend);
        self.draw_asteroids(backend);
        self.draw_skybox(backend);
        backend.end_render_pass();

        self.target.resolve(backend)?;

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Composite Pass".into()),
            color_attachments: vec![ColorAttachment {
                view: frame.swapchain_view,
                resolve_target: None,
                load_op: LoadOp::Clear([1.0, 1.0, 1.0, 1.0]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        backend.set_viewport(0.0, 0.0, frame.width as f32, frame.height as f32, 0.0, 1.0);
        backend.set_render_pipeline(self.programs.composite.pipeline);
        backend.set_bind_group(0, self.groups.composite);
        backend.set_vertex_buffer(0, self.quad_vertices, 0);
        backend.draw(0..SCREEN_QUAD_VERTICES.len() as u32, 0..1);
        backend.end_render_pass();

        backend.end_frame()?;
        Ok(())
    }

    fn write_uniforms<B: GraphicsBackend>(&mut self, backend: &mut B, camera: &Camera, elapsed: f32, width: u32, height: u32) {
        let params = &self.params;
        self.uniforms.frame.write(
            backend,
            FrameUniform::new(
                camera.view_matrix(),
                params.projection.matrix(width, height),
                camera.position,
                elapsed,
                params.spin_rate,
            ),
        );
        self.uniforms
            .planet_object
            .write(backend, ObjectUniform::new(params.planet.model_matrix(elapsed)));
        self.uniforms.planet_light.write(
            backend,
            LightUniform::new(&params.light, &params.planet_terms, params.shininess),
        );
        self.uniforms.asteroid_light.write(
            backend,
            LightUniform::new(&params.light, &params.asteroid_terms, params.shininess),
        );
    }

    fn draw_planet<B: GraphicsBackend>(&self, backend: &mut B) {
        if self.scene.planet.is_empty() {
            return;
        }
        backend.set_render_pipeline(self.programs.planet.pipeline);
        backend.set_bind_group(0, self.groups.frame);
        backend.set_bind_group(1, self.groups.planet_lighting);
        for (mesh, material) in self.scene.planet.meshes().iter().zip(&self.groups.planet_materials) {
            backend.set_bind_group(2, *material);
            mesh.geometry.draw(backend);
        }
    }

    fn draw_asteroids<B: GraphicsBackend>(&self, backend: &mut B) {
        if self.scene.asteroids.model().is_empty() || self.scene.asteroids.instance_count() == 0 {
            return;
        }
        backend.set_render_pipeline(self.programs.asteroids.pipeline);
        backend.set_bind_group(0, self.groups.frame);
        backend.set_bind_group(1, self.groups.asteroid_light);
        backend.set_bind_group(2, self.groups.asteroid_material);
        self.scene.asteroids.draw_instanced(backend);
    }

    fn draw_skybox<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.set_render_pipeline(self.programs.skybox.pipeline);
        backend.set_bind_group(0, self.groups.frame);
        backend.set_bind_group(1, self.groups.skybox);
        backend.set_vertex_buffer(0, self.skybox_vertices, 0);
        backend.draw(0..SKYBOX_VERTICES.len() as u32, 0..1);
    }

    /// Follow a new surface size. Both target attachments are reallocated and
    /// the composite bind group is rebuilt against the new resolve texture.
    /// A zero-sized surface (minimized window) is ignored.
    pub fn resize<B: GraphicsBackend>(&mut self, backend: &mut B, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if self.target.size() == Some((width, height)) {
            return Ok(());
        }
        self.target.resize(backend, width, height)?;

        let old = self.groups.composite;
        let composite = self.allocations.sampled(
            backend,
            self.programs.layouts.composite,
            self.target.resolve_view()?,
            self.composite_sampler,
        )?;
        self.allocations.bind_groups.retain(|&g| g != old);
        backend.destroy_bind_group(old);
        self.groups.composite = composite;
        log::info!("Offscreen target resized to {}x{}", width, height);
        Ok(())
    }

    /// Release every GPU object: bind groups and buffers, then programs, the
    /// target and finally the scene's meshes and textures.
    pub fn destroy<B: GraphicsBackend>(mut self, backend: &mut B) {
        self.allocations.release(backend);
        self.programs.destroy(backend);
        self.target.destroy(backend);
        self.scene.destroy(backend);
    }
}
