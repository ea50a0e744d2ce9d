//! Render programs: shader, bind group layouts and pipeline state per draw kind
//!
//! Bind group convention shared by the WGSL sources:
//!
//! - planet: `0` frame, `1` object + light, `2` diffuse texture + sampler
//! - asteroids: `0` frame, `1` light, `2` diffuse texture + sampler
//! - skybox: `0` frame, `1` cubemap + sampler
//! - composite: `0` resolve texture + sampler

use std::path::Path;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::pipeline::geometry_buffer::GeometryBuffer;
use crate::resources::{CompiledShader, ShaderSource};

pub const PLANET_SHADER: &str = "planet";
pub const ASTEROIDS_SHADER: &str = "asteroids";
pub const SKYBOX_SHADER: &str = "skybox";
pub const COMPOSITE_SHADER: &str = "screen";

/// Vertex layout of the skybox cube: bare positions
pub fn skybox_layout() -> VertexBufferLayout {
    VertexBufferLayout {
        array_stride: VertexFormat::Float32x3.size(),
        step_mode: VertexStepMode::Vertex,
        attributes: vec![VertexAttribute {
            location: 0,
            format: VertexFormat::Float32x3,
            offset: 0,
        }],
    }
}

/// Vertex layout of the fullscreen quad: clip-space xy, then uv
pub fn screen_quad_layout() -> VertexBufferLayout {
    VertexBufferLayout {
        array_stride: VertexFormat::Float32x4.size(),
        step_mode: VertexStepMode::Vertex,
        attributes: vec![
            VertexAttribute {
                location: 0,
                format: VertexFormat::Float32x2,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                format: VertexFormat::Float32x2,
                offset: VertexFormat::Float32x2.size(),
            },
        ],
    }
}

/// Bind group layouts shared across programs
#[derive(Debug, Clone, Copy)]
pub struct BindingLayouts {
    pub frame: BindGroupLayoutHandle,
    pub lighting: BindGroupLayoutHandle,
    /// Light only; instances carry their own transforms
    pub light: BindGroupLayoutHandle,
    pub material: BindGroupLayoutHandle,
    pub cubemap: BindGroupLayoutHandle,
    pub composite: BindGroupLayoutHandle,
}

impl BindingLayouts {
    pub fn new<B: GraphicsBackend>(backend: &mut B) -> RenderResult<Self> {
        let sampled = |view_dimension| {
            [
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: BindingType::Texture { view_dimension },
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: BindingType::Sampler,
                },
            ]
        };

        Ok(Self {
            frame: backend.create_bind_group_layout(&[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            }])?,
            lighting: backend.create_bind_group_layout(&[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStageFlags::VERTEX,
                    ty: BindingType::UniformBuffer,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: BindingType::UniformBuffer,
                },
            ])?,
            light: backend.create_bind_group_layout(&[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            }])?,
            material: backend.create_bind_group_layout(&sampled(TextureViewDimension::D2))?,
            cubemap: backend.create_bind_group_layout(&sampled(TextureViewDimension::Cube))?,
            composite: backend.create_bind_group_layout(&sampled(TextureViewDimension::D2))?,
        })
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        for layout in [
            self.frame,
            self.lighting,
            self.light,
            self.material,
            self.cubemap,
            self.composite,
        ] {
            backend.destroy_bind_group_layout(layout);
        }
    }
}

/// One validated pipeline
#[derive(Debug)]
pub struct RenderProgram {
    pub pipeline: RenderPipelineHandle,
    pub shader: CompiledShader,
}

impl RenderProgram {
    /// Check the shader's vertex inputs against `desc.vertex_layouts`, then
    /// create the pipeline
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        shader: CompiledShader,
        mut desc: RenderPipelineDescriptor,
    ) -> RenderResult<Self> {
        shader.check_vertex_layouts(&desc.vertex_layouts)?;
        desc.shader = shader.code.clone();
        let pipeline = backend.create_render_pipeline(&desc)?;
        log::debug!("Created pipeline '{}'", shader.name);
        Ok(Self { pipeline, shader })
    }
}

/// Formats and sample count the programs render with
#[derive(Debug, Clone, Copy)]
pub struct TargetFormats {
    pub scene_color: TextureFormat,
    pub scene_depth: TextureFormat,
    pub sample_count: u32,
    pub present: TextureFormat,
}

/// Every program the frame renderer draws with
#[derive(Debug)]
pub struct Programs {
    pub layouts: BindingLayouts,
    pub planet: RenderProgram,
    pub asteroids: RenderProgram,
    pub skybox: RenderProgram,
    pub composite: RenderProgram,
}

impl Programs {
    /// Load, compile and build all programs from `shader_dir`
    pub fn load<B: GraphicsBackend>(backend: &mut B, shader_dir: &Path, formats: TargetFormats) -> RenderResult<Self> {
        let compile = |name: &str| -> RenderResult<CompiledShader> { ShaderSource::load(shader_dir, name)?.compile() };
        let planet = compile(PLANET_SHADER)?;
        let asteroids = compile(ASTEROIDS_SHADER)?;
        let skybox = compile(SKYBOX_SHADER)?;
        let composite = compile(COMPOSITE_SHADER)?;
        Self::new(backend, [planet, asteroids, skybox, composite], formats)
    }

    /// Build from compiled planet, asteroid, skybox and composite shaders.
    /// On failure everything created so far is released.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        shaders: [CompiledShader; 4],
        formats: TargetFormats,
    ) -> RenderResult<Self> {
        let layouts = BindingLayouts::new(backend)?;
        let mut created = Vec::new();
        match Self::build(backend, &layouts, shaders, formats, &mut created) {
            Ok([planet, asteroids, skybox, composite]) => Ok(Self {
                layouts,
                planet,
                asteroids,
                skybox,
                composite,
            }),
            Err(e) => {
                for pipeline in created {
                    backend.destroy_render_pipeline(pipeline);
                }
                layouts.destroy(backend);
                Err(e)
            }
        }
    }

    fn build<B: GraphicsBackend>(
        backend: &mut B,
        layouts: &BindingLayouts,
        shaders: [CompiledShader; 4],
        formats: TargetFormats,
        created: &mut Vec<RenderPipelineHandle>,
    ) -> RenderResult<[RenderProgram; 4]> {
        let scene = |label: &str,
                     vertex_layouts: Vec<VertexBufferLayout>,
                     bind_group_layouts: Vec<BindGroupLayoutHandle>,
                     cull_mode: CullMode,
                     depth_write_enabled: bool,
                     depth_compare: CompareFunction| RenderPipelineDescriptor {
            label: Some(label.to_string()),
            shader: String::new(),
            vertex_layouts,
            bind_group_layouts,
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode,
            depth_stencil: Some(DepthStencilState {
                format: formats.scene_depth,
                depth_write_enabled,
                depth_compare,
            }),
            color_format: formats.scene_color,
            sample_count: formats.sample_count,
        };
        let planet_groups = vec![layouts.frame, layouts.lighting, layouts.material];
        let asteroid_groups = vec![layouts.frame, layouts.light, layouts.material];
        let mut instanced = vec![GeometryBuffer::mesh_layout()];
        instanced.extend(GeometryBuffer::instance_layouts());

        let [planet, asteroids, skybox, composite] = shaders;
        let descriptors = [
            scene(
                "Planet",
                vec![GeometryBuffer::mesh_layout()],
                planet_groups,
                CullMode::Back,
                true,
                CompareFunction::Less,
            ),
            scene("Asteroids", instanced, asteroid_groups, CullMode::Back, true, CompareFunction::Less),
            // Cube sits at the far plane: pass on equal depth, never write
            scene(
                "Skybox",
                vec![skybox_layout()],
                vec![layouts.frame, layouts.cubemap],
                CullMode::None,
                false,
                CompareFunction::LessEqual,
            ),
            RenderPipelineDescriptor {
                label: Some("Composite".into()),
                shader: String::new(),
                vertex_layouts: vec![screen_quad_layout()],
                bind_group_layouts: vec![layouts.composite],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: None,
                color_format: formats.present,
                sample_count: 1,
            },
        ];

        let [d_planet, d_asteroids, d_skybox, d_composite] = descriptors;
        let mut program = |shader, desc| -> RenderResult<RenderProgram> {
            let program = RenderProgram::new(backend, shader, desc)?;
            created.push(program.pipeline);
            Ok(program)
        };
        Ok([
            program(planet, d_planet)?,
            program(asteroids, d_asteroids)?,
            program(skybox, d_skybox)?,
            program(composite, d_composite)?,
        ])
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        for program in [self.planet, self.asteroids, self.skybox, self.composite] {
            backend.destroy_render_pipeline(program.pipeline);
        }
        self.layouts.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordingBackend, ResourceKind};
    use crate::error::RenderError;
    use std::path::PathBuf;

    fn shader_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders")
    }

    fn formats(sample_count: u32) -> TargetFormats {
        TargetFormats {
            scene_color: TextureFormat::Rgba8Unorm,
            scene_depth: TextureFormat::Depth24PlusStencil8,
            sample_count,
            present: TextureFormat::Bgra8Unorm,
        }
    }

    #[test]
    fn bundled_programs_match_the_slot_contract() {
        let mut backend = RecordingBackend::new(64, 64);
        let programs = Programs::load(&mut backend, &shader_dir(), formats(8)).unwrap();

        let skybox = backend.pipeline_descriptor(programs.skybox.pipeline).unwrap();
        let depth = skybox.depth_stencil.unwrap();
        assert_eq!(depth.depth_compare, CompareFunction::LessEqual);
        assert!(!depth.depth_write_enabled);

        let composite = backend.pipeline_descriptor(programs.composite.pipeline).unwrap();
        assert!(composite.depth_stencil.is_none());
        assert_eq!(composite.sample_count, 1);

        let asteroids = backend.pipeline_descriptor(programs.asteroids.pipeline).unwrap();
        assert_eq!(asteroids.vertex_layouts.len(), 3);
        assert_eq!(asteroids.sample_count, 8);
        assert_eq!(
            asteroids.bind_group_layouts,
            vec![programs.layouts.frame, programs.layouts.light, programs.layouts.material]
        );

        programs.destroy(&mut backend);
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn mismatched_shader_is_rejected_before_pipeline_creation() {
        let mut backend = RecordingBackend::new(64, 64);
        let load = |name: &str| ShaderSource::load(&shader_dir(), name).unwrap().compile().unwrap();
        // The asteroid shader in the planet slot reads instance inputs the
        // planet layout does not bind
        let shaders = [
            load(ASTEROIDS_SHADER),
            load(ASTEROIDS_SHADER),
            load(SKYBOX_SHADER),
            load(COMPOSITE_SHADER),
        ];
        let err = Programs::new(&mut backend, shaders, formats(4)).unwrap_err();
        assert!(matches!(err, RenderError::VertexLayoutMismatch { .. }));
        assert_eq!(backend.live_count(ResourceKind::RenderPipeline), 0);
        assert_eq!(backend.live_count(ResourceKind::BindGroupLayout), 0);
    }

    #[test]
    fn missing_shader_file_is_a_compile_failure() {
        let mut backend = RecordingBackend::new(64, 64);
        let err = Programs::load(&mut backend, Path::new("no/such/dir"), formats(1)).unwrap_err();
        assert!(matches!(err, RenderError::ShaderCompileFailure { .. }));
    }
}
