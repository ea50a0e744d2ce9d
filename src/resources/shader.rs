//! WGSL program loading, validation and vertex-input reflection

use std::path::{Path, PathBuf};

use naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::backend::types::{VertexBufferLayout, VertexFormat};
use crate::error::{RenderError, RenderResult};

/// Vertex entry point every program provides
pub const VERTEX_ENTRY: &str = "vs_main";
/// Fragment entry point every program provides
pub const FRAGMENT_ENTRY: &str = "fs_main";

/// WGSL source text of one program
#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub name: String,
    pub path: Option<PathBuf>,
    pub code: String,
}

impl ShaderSource {
    pub fn new(name: &str, code: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            code: code.into(),
        }
    }

    /// Read `<dir>/<name>.wgsl`
    pub fn load(dir: &Path, name: &str) -> RenderResult<Self> {
        let path = dir.join(format!("{}.wgsl", name));
        let code = std::fs::read_to_string(&path).map_err(|e| RenderError::ShaderCompileFailure {
            name: name.to_string(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Ok(Self {
            name: name.to_string(),
            path: Some(path),
            code,
        })
    }

    /// Parse and validate, and reflect the vertex inputs
    pub fn compile(self) -> RenderResult<CompiledShader> {
        let fail = |reason: String| RenderError::ShaderCompileFailure {
            name: self.name.clone(),
            reason,
        };

        let module = naga::front::wgsl::parse_str(&self.code)
            .map_err(|e| fail(e.emit_to_string(&self.code)))?;
        Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| fail(e.into_inner().to_string()))?;

        let find = |stage: naga::ShaderStage, name: &str| {
            module
                .entry_points
                .iter()
                .find(|ep| ep.stage == stage && ep.name == name)
        };
        let vertex = find(naga::ShaderStage::Vertex, VERTEX_ENTRY)
            .ok_or_else(|| fail(format!("missing vertex entry point `{}`", VERTEX_ENTRY)))?;
        if find(naga::ShaderStage::Fragment, FRAGMENT_ENTRY).is_none() {
            return Err(fail(format!(
                "missing fragment entry point `{}`",
                FRAGMENT_ENTRY
            )));
        }

        let mut inputs = Vec::new();
        for arg in &vertex.function.arguments {
            match &arg.binding {
                Some(binding) => collect_input(&module, binding, arg.ty, &mut inputs),
                None => {
                    if let naga::TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                        for member in members {
                            if let Some(binding) = &member.binding {
                                collect_input(&module, binding, member.ty, &mut inputs);
                            }
                        }
                    }
                }
            }
        }
        inputs.sort_by_key(|input| input.location);

        log::debug!(
            "Compiled shader '{}' with {} vertex inputs",
            self.name,
            inputs.len()
        );
        Ok(CompiledShader {
            name: self.name,
            code: self.code,
            inputs,
        })
    }
}

fn collect_input(
    module: &naga::Module,
    binding: &naga::Binding,
    ty: naga::Handle<naga::Type>,
    inputs: &mut Vec<ShaderInput>,
) {
    if let naga::Binding::Location { location, .. } = binding {
        inputs.push(ShaderInput {
            location: *location,
            format: vertex_format(&module.types[ty].inner),
        });
    }
}

fn vertex_format(inner: &naga::TypeInner) -> Option<VertexFormat> {
    let is_f32 = |scalar: &naga::Scalar| scalar.kind == naga::ScalarKind::Float && scalar.width == 4;
    match inner {
        naga::TypeInner::Scalar(scalar) if is_f32(scalar) => Some(VertexFormat::Float32),
        naga::TypeInner::Vector { size, scalar } if is_f32(scalar) => Some(match size {
            naga::VectorSize::Bi => VertexFormat::Float32x2,
            naga::VectorSize::Tri => VertexFormat::Float32x3,
            naga::VectorSize::Quad => VertexFormat::Float32x4,
        }),
        _ => None,
    }
}

/// A vertex-stage input declared by a shader. `format` is `None` for types no
/// vertex buffer in this renderer can feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderInput {
    pub location: u32,
    pub format: Option<VertexFormat>,
}

/// Validated program with its reflected vertex inputs
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub name: String,
    pub code: String,
    inputs: Vec<ShaderInput>,
}

impl CompiledShader {
    /// Vertex inputs sorted by location
    pub fn inputs(&self) -> &[ShaderInput] {
        &self.inputs
    }

    /// Check that every shader input is fed by exactly one attribute of
    /// matching format. Attributes the shader ignores are allowed.
    pub fn check_vertex_layouts(&self, layouts: &[VertexBufferLayout]) -> RenderResult<()> {
        let mismatch = |reason: String| RenderError::VertexLayoutMismatch {
            shader: self.name.clone(),
            reason,
        };

        let mut seen = Vec::new();
        for attr in layouts.iter().flat_map(|l| l.attributes.iter()) {
            if seen.contains(&attr.location) {
                return Err(mismatch(format!(
                    "location {} is bound by more than one attribute",
                    attr.location
                )));
            }
            seen.push(attr.location);
        }

        for input in &self.inputs {
            let format = input.format.ok_or_else(|| {
                mismatch(format!(
                    "input at location {} is not a 32-bit float scalar or vector",
                    input.location
                ))
            })?;
            let attr = layouts
                .iter()
                .flat_map(|l| l.attributes.iter())
                .find(|a| a.location == input.location)
                .ok_or_else(|| mismatch(format!("no attribute bound at location {}", input.location)))?;
            if attr.format != format {
                return Err(mismatch(format!(
                    "location {} expects {:?}, layout provides {:?}",
                    input.location, format, attr.format
                )));
            }
        }
        Ok(())
    }
}
