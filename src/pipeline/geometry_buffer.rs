//! GPU vertex/index buffers of one mesh and its vertex-input contract
//!
//! Attribute locations are fixed and shared with every program's `vs_main`:
//!
//! | location | attribute            | buffer slot | step     |
//! |----------|----------------------|-------------|----------|
//! | 0        | position             | 0           | vertex   |
//! | 1        | normal               | 0           | vertex   |
//! | 2        | texture coordinate   | 0           | vertex   |
//! | 3..=6    | instance transform   | 1           | instance |
//! | 7        | instance spin speed  | 2           | instance |
//!
//! The transform occupies four consecutive locations, one per matrix column,
//! matching glam's column-major `Mat4`.

use glam::Mat4;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::resources::MeshData;

pub const POSITION_LOCATION: u32 = 0;
pub const NORMAL_LOCATION: u32 = 1;
pub const TEXCOORD_LOCATION: u32 = 2;
pub const INSTANCE_TRANSFORM_LOCATION: u32 = 3;
pub const INSTANCE_SPEED_LOCATION: u32 = 7;

pub const MESH_SLOT: u32 = 0;
pub const TRANSFORM_SLOT: u32 = 1;
pub const SPEED_SLOT: u32 = 2;

/// Per-instance buffers bound alongside a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceBuffers {
    pub transforms: BufferHandle,
    pub speeds: BufferHandle,
    pub count: u32,
}

/// Vertex and index buffers of one mesh, optionally wired to instance buffers
#[derive(Debug)]
pub struct GeometryBuffer {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    index_count: u32,
    instances: Option<InstanceBuffers>,
}

impl GeometryBuffer {
    /// Upload a mesh's vertices and indices
    pub fn upload<B: GraphicsBackend>(backend: &mut B, mesh: &MeshData) -> RenderResult<Self> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} vertices", mesh.name)),
                size: mesh.vertex_bytes().len() as u64,
                usage: BufferUsage::VERTEX,
            },
            mesh.vertex_bytes(),
        )?;
        let index_buffer = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} indices", mesh.name)),
                size: mesh.index_bytes().len() as u64,
                usage: BufferUsage::INDEX,
            },
            mesh.index_bytes(),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.destroy_buffer(vertex_buffer);
                return Err(e.into());
            }
        };

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.index_count() as u32,
            instances: None,
        })
    }

    /// Attach per-instance transform and speed buffers. From now on `draw`
    /// issues `count` instances and `vertex_layouts` includes the instance
    /// layouts. The buffers stay owned by the caller.
    pub fn configure(&mut self, transforms: BufferHandle, speeds: BufferHandle, count: u32) {
        self.instances = Some(InstanceBuffers {
            transforms,
            speeds,
            count,
        });
    }

    pub fn instances(&self) -> Option<InstanceBuffers> {
        self.instances
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Per-vertex layout: position, normal and texture coordinate out of the
    /// full [`Vertex`]
    pub fn mesh_layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: vec![
                VertexAttribute {
                    location: POSITION_LOCATION,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: NORMAL_LOCATION,
                    format: VertexFormat::Float32x3,
                    offset: Vertex::NORMAL_OFFSET,
                },
                VertexAttribute {
                    location: TEXCOORD_LOCATION,
                    format: VertexFormat::Float32x2,
                    offset: Vertex::UV_OFFSET,
                },
            ],
        }
    }

    /// Per-instance layouts: the transform across four locations, then the speed
    pub fn instance_layouts() -> [VertexBufferLayout; 2] {
        let column = VertexFormat::Float32x4.size();
        [
            VertexBufferLayout {
                array_stride: std::mem::size_of::<Mat4>() as u64,
                step_mode: VertexStepMode::Instance,
                attributes: (0..4)
                    .map(|i| VertexAttribute {
                        location: INSTANCE_TRANSFORM_LOCATION + i as u32,
                        format: VertexFormat::Float32x4,
                        offset: column * i,
                    })
                    .collect(),
            },
            VertexBufferLayout {
                array_stride: std::mem::size_of::<f32>() as u64,
                step_mode: VertexStepMode::Instance,
                attributes: vec![VertexAttribute {
                    location: INSTANCE_SPEED_LOCATION,
                    format: VertexFormat::Float32,
                    offset: 0,
                }],
            },
        ]
    }

    /// Layouts in buffer-slot order for the current configuration
    pub fn vertex_layouts(&self) -> Vec<VertexBufferLayout> {
        let mut layouts = vec![Self::mesh_layout()];
        if self.instances.is_some() {
            layouts.extend(Self::instance_layouts());
        }
        layouts
    }

    /// Bind vertex, index and any instance buffers
    pub fn bind<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.set_vertex_buffer(MESH_SLOT, self.vertex_buffer, 0);
        if let Some(instances) = self.instances {
            backend.set_vertex_buffer(TRANSFORM_SLOT, instances.transforms, 0);
            backend.set_vertex_buffer(SPEED_SLOT, instances.speeds, 0);
        }
        backend.set_index_buffer(self.index_buffer, 0, IndexFormat::Uint32);
    }

    /// Bind and issue one indexed draw covering every configured instance
    pub fn draw<B: GraphicsBackend>(&self, backend: &mut B) {
        self.bind(backend);
        let instance_count = self.instances.map_or(1, |i| i.count);
        backend.draw_indexed(0..self.index_count, 0, 0..instance_count);
    }

    /// Release the mesh buffers. Instance buffers belong to their owner.
    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}
